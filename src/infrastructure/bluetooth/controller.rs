//! Controller Module
//!
//! Single entry point over the active radio backend. Every operation is a
//! plain forward to the [`Driver`]; the controller only adds a uniform event
//! stream for listeners.

use crate::domain::context::GattContext;
use crate::domain::models::{
    AuthParams, BondParam, BondSetting, CharacteristicRef, ConnectionHandle, ControllerEvent,
    DriverEvent, LinkParams, NotifyConfig, PeripheralInfo, RawGattTable, ResetMode, ScanParams,
};
use crate::domain::settings::{BackendKind, DriverConfig};
use crate::error::Result;
use crate::infrastructure::bluetooth::driver::Driver;
use crate::infrastructure::codec::ValueCodec;
use crate::infrastructure::persistence::Synchronizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// The radio backend a controller drives.
///
/// A host radio reports every sighting as a discover event on its own; a
/// network processor only answers the scan command with the full list.
#[derive(Clone)]
pub enum Backend {
    HostRadio(Arc<dyn Driver>),
    NetworkProcessor(Arc<dyn Driver>),
}

impl Backend {
    /// Which kind of backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::HostRadio(_) => BackendKind::HostRadio,
            Self::NetworkProcessor(_) => BackendKind::NetworkProcessor,
        }
    }

    /// The driver behind either backend.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        match self {
            Self::HostRadio(driver) | Self::NetworkProcessor(driver) => driver,
        }
    }

    /// Pair a driver with the backend kind named in settings.
    pub fn from_kind(kind: BackendKind, driver: Arc<dyn Driver>) -> Self {
        match kind {
            BackendKind::HostRadio => Self::HostRadio(driver),
            BackendKind::NetworkProcessor => Self::NetworkProcessor(driver),
        }
    }
}

pub struct Controller {
    backend: Backend,
    events: broadcast::Sender<ControllerEvent>,
    bridge: JoinHandle<()>,
}

impl Controller {
    /// Must be called inside a tokio runtime; spawns the event bridge.
    pub fn new(backend: Backend) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let bridge = spawn_bridge(backend.driver().subscribe(), events.clone());
        info!("Controller created on {:?} backend", backend.kind());
        Self {
            backend,
            events,
            bridge,
        }
    }

    /// The backend chosen at construction.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Kind of the active backend.
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn driver(&self) -> &dyn Driver {
        self.backend.driver().as_ref()
    }

    /// Listen for discoveries, data and link loss on either backend.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Shared context for building peripherals on this controller's driver.
    pub fn gatt(
        &self,
        codec: Arc<dyn ValueCodec>,
        sync: Synchronizer,
        discovery_timeout: Duration,
    ) -> GattContext {
        GattContext::new(self.backend.driver().clone(), codec, sync)
            .with_discovery_timeout(discovery_timeout)
    }

    /// Open the transport (serial port or host adapter).
    pub async fn init(&self, config: &DriverConfig) -> Result<()> {
        Ok(self.driver().init(config).await?)
    }

    /// Release the transport.
    pub async fn close(&self) -> Result<()> {
        Ok(self.driver().close().await?)
    }

    /// Soft or hard reset of the radio.
    pub async fn reset(&self, mode: ResetMode) -> Result<()> {
        Ok(self.driver().reset(mode).await?)
    }

    /// Scan once. A network processor's result list is re-emitted as one
    /// `Discover` event so listeners see the same contract on both backends.
    pub async fn scan(&self) -> Result<Vec<PeripheralInfo>> {
        let found = self.driver().scan().await?;
        debug!("Scan found {} peripheral(s)", found.len());

        if let Backend::NetworkProcessor(_) = self.backend {
            // no receivers is fine
            let _ = self.events.send(ControllerEvent::Discover(found.clone()));
        }
        Ok(found)
    }

    /// Stop a running scan.
    pub async fn cancel_scan(&self) -> Result<()> {
        Ok(self.driver().cancel_scan().await?)
    }

    /// Scan interval, window and duration for later scans.
    pub async fn set_scan_params(&self, params: ScanParams) -> Result<()> {
        Ok(self.driver().set_scan_params(params).await?)
    }

    /// Default connection parameters for later connects.
    pub async fn set_link_params(&self, params: LinkParams) -> Result<()> {
        Ok(self.driver().set_link_params(params).await?)
    }

    /// Configure one pairing / bonding parameter.
    pub async fn set_bond_param(&self, param: BondParam) -> Result<()> {
        Ok(self.driver().set_bond_param(param).await?)
    }

    /// Connect to a scanned peripheral and return its link handle.
    pub async fn connect(&self, peripheral: &PeripheralInfo) -> Result<ConnectionHandle> {
        Ok(self.driver().connect(peripheral).await?)
    }

    /// Abort a pending connect.
    pub async fn connect_cancel(&self, peripheral: &PeripheralInfo) -> Result<()> {
        Ok(self.driver().connect_cancel(peripheral).await?)
    }

    /// Tear down the link to a peripheral.
    pub async fn disconnect(&self, peripheral: &PeripheralInfo) -> Result<()> {
        Ok(self.driver().disconnect(peripheral).await?)
    }

    /// Renegotiate parameters of an established link.
    pub async fn update_link_params(
        &self,
        peripheral: &PeripheralInfo,
        params: LinkParams,
    ) -> Result<()> {
        Ok(self.driver().update_link_params(peripheral, params).await?)
    }

    /// Walk the full GATT table of a connected peripheral.
    pub async fn discover_all(&self, peripheral: &PeripheralInfo) -> Result<RawGattTable> {
        Ok(self.driver().discover_all(peripheral).await?)
    }

    /// Read a characteristic value.
    pub async fn read(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>> {
        Ok(self.driver().read(characteristic).await?)
    }

    /// Read a characteristic's user description.
    pub async fn read_descriptor(&self, characteristic: &CharacteristicRef) -> Result<Vec<u8>> {
        Ok(self.driver().read_descriptor(characteristic).await?)
    }

    /// Write a characteristic value.
    pub async fn write(
        &self,
        characteristic: &CharacteristicRef,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        Ok(self
            .driver()
            .write(characteristic, data, with_response)
            .await?)
    }

    /// Turn notifications or indications on or off.
    pub async fn notify(&self, characteristic: &CharacteristicRef, config: NotifyConfig) -> Result<()> {
        Ok(self.driver().notify(characteristic, config).await?)
    }

    /// Acknowledge a received indication.
    pub async fn confirm_indication(&self, handle: ConnectionHandle) -> Result<()> {
        Ok(self.driver().confirm_indication(handle).await?)
    }

    /// Answer a passkey request.
    pub async fn passkey_update(&self, peripheral: &PeripheralInfo, passkey: &str) -> Result<()> {
        Ok(self.driver().passkey_update(peripheral, passkey).await?)
    }

    /// Start pairing with a peripheral.
    pub async fn authenticate(&self, peripheral: &PeripheralInfo, params: AuthParams) -> Result<()> {
        Ok(self.driver().authenticate(peripheral, params).await?)
    }

    /// Abort a running pairing.
    pub async fn terminate_auth(&self, peripheral: &PeripheralInfo) -> Result<()> {
        Ok(self.driver().terminate_auth(peripheral).await?)
    }

    /// Re-encrypt the link with stored bonding keys.
    pub async fn bond(&self, peripheral: &PeripheralInfo, mitm: bool, setting: &BondSetting) -> Result<()> {
        Ok(self.driver().bond(peripheral, mitm, setting).await?)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.bridge.abort();
    }
}

/// Forward driver events to controller listeners until the driver goes away.
fn spawn_bridge(
    mut from: broadcast::Receiver<DriverEvent>,
    to: broadcast::Sender<ControllerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match from.recv().await {
                Ok(event) => {
                    let _ = to.send(ControllerEvent::from(event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Controller event bridge lagged, {} driver events lost", skipped);
                }
                Err(RecvError::Closed) => {
                    debug!("Driver event stream closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::infrastructure::mock::MockDriver;
    use tokio::time::timeout;

    fn device(address: &str) -> PeripheralInfo {
        PeripheralInfo {
            address: address.to_string(),
            connectable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_network_processor_scan_emits_discover() {
        let driver = Arc::new(MockDriver::new());
        driver.set_scan_results(vec![device("0x9059af0b8457"), device("0x544a165e1f53")]);
        let controller = Controller::new(Backend::NetworkProcessor(driver.clone()));
        let mut events = controller.subscribe();

        let found = controller.scan().await.unwrap();
        assert_eq!(found.len(), 2);

        match events.recv().await.unwrap() {
            ControllerEvent::Discover(list) => assert_eq!(list, found),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(driver.calls_of("scan"), 1);
    }

    #[tokio::test]
    async fn test_host_radio_scan_relies_on_native_events() {
        let driver = Arc::new(MockDriver::new());
        driver.set_scan_results(vec![device("0x9059af0b8457")]);
        let controller = Controller::new(Backend::HostRadio(driver.clone()));
        let mut events = controller.subscribe();

        controller.scan().await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), events.recv()).await.is_err(),
            "host radio scan must not re-emit discover"
        );

        driver.emit(DriverEvent::Discover(device("0x9059af0b8457")));
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ControllerEvent::Discover(vec![device("0x9059af0b8457")]));
    }

    #[tokio::test]
    async fn test_operations_forward_to_driver() {
        let driver = Arc::new(MockDriver::new());
        let controller = Controller::new(Backend::HostRadio(driver.clone()));
        let target = device("0x9059af0b8457");

        controller.init(&DriverConfig::default()).await.unwrap();
        let handle = controller.connect(&target).await.unwrap();
        controller.confirm_indication(handle).await.unwrap();
        controller
            .bond(&target, true, &BondSetting::default())
            .await
            .unwrap();
        controller.close().await.unwrap();

        assert_eq!(
            driver.calls(),
            vec!["init", "connect", "confirm_indication", "bond", "close"]
        );
    }

    #[tokio::test]
    async fn test_driver_failure_is_transport_error() {
        let driver = Arc::new(MockDriver::new());
        driver.fail("connect");
        let controller = Controller::new(Backend::NetworkProcessor(driver));

        let err = controller.connect(&device("0xaa")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref e) if e.operation == "connect"));
    }

    #[tokio::test]
    async fn test_backend_from_settings_kind() {
        let driver: Arc<dyn Driver> = Arc::new(MockDriver::new());
        let backend = Backend::from_kind(BackendKind::NetworkProcessor, driver);
        assert_eq!(backend.kind(), BackendKind::NetworkProcessor);

        let controller = Controller::new(backend);
        assert_eq!(controller.kind(), BackendKind::NetworkProcessor);
    }
}
