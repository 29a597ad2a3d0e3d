//! Peripheral entity: identity, connection state and the services it owns.

use crate::domain::characteristic::Characteristic;
use crate::domain::context::{run_sequentially, GattContext, Link};
use crate::domain::models::{
    AddressType, AuthParams, AuthState, BondSetting, CharValue, ConnectionHandle, ConnectionState,
    DiscoveryState, DriverEvent, LinkParams, NotifyConfig, PeripheralInfo,
};
use crate::domain::service::Service;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::protocol::canonical_uuid;
use crate::infrastructure::persistence::sync::{PeripheralRecord, PERIPHERAL_ROLE};
use crate::infrastructure::persistence::{EntityKind, Record};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Peripheral {
    pub(crate) link: Arc<Link>,
    state: ConnectionState,
    link_params: Option<LinkParams>,
    pub(crate) services: BTreeMap<String, Service>,
    pub(crate) discovery: DiscoveryState,
}

impl Peripheral {
    /// Wrap a device reported by the transport.
    pub fn new(info: PeripheralInfo, ctx: GattContext) -> Self {
        Self {
            link: Arc::new(Link::new(ctx, info)),
            state: ConnectionState::Discovered,
            link_params: None,
            services: BTreeMap::new(),
            discovery: DiscoveryState::Idle,
        }
    }

    /// Always `"peripheral"`; stored as the record's role.
    pub fn role(&self) -> &'static str {
        PERIPHERAL_ROLE
    }

    pub fn address(&self) -> &str {
        self.link.address()
    }

    /// Public or random device address.
    pub fn address_type(&self) -> AddressType {
        self.link.info.address_type
    }

    pub fn info(&self) -> &PeripheralInfo {
        &self.link.info
    }

    /// Transport handle of the live link, if any.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.link.connection_handle()
    }

    /// Connection state. A link the transport reported lost reads as
    /// `Disconnected` even before `disconnect` is called.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected if self.link.connection_handle().is_none() => {
                ConnectionState::Disconnected
            }
            state => state,
        }
    }

    /// Last link parameters the transport accepted.
    pub fn link_params(&self) -> Option<LinkParams> {
        self.link_params
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery
    }

    /// Services keyed by canonical UUID.
    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    pub fn service(&self, uuid: &str) -> Option<&Service> {
        self.services.get(uuid)
    }

    /// Persisted record id.
    pub fn id(&self) -> &str {
        self.address()
    }

    fn ctx(&self) -> &GattContext {
        &self.link.ctx
    }

    fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.values().flat_map(|s| s.characteristics.values())
    }

    /// Establish the link; the transport owns link-establishment timing.
    pub async fn connect(&mut self) -> Result<()> {
        let previous = self.state();
        self.state = ConnectionState::Connecting;
        info!("Connecting to {}", self.address());

        match self.ctx().driver.connect(&self.link.info).await {
            Ok(handle) => {
                self.link.set_connection_handle(Some(handle));
                self.state = ConnectionState::Connected;
                info!("Connected to {} ({:?})", self.address(), handle);
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                warn!("Connect to {} failed: {}", self.address(), e);
                Err(e.into())
            }
        }
    }

    /// Tear the link down.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.ctx().driver.disconnect(&self.link.info).await?;
        self.link.set_connection_handle(None);
        self.state = ConnectionState::Disconnected;
        info!("Disconnected from {}", self.address());
        Ok(())
    }

    /// Disconnect, forget every persisted record of this device and fall
    /// back to the `discovered` state.
    pub async fn remove(&mut self) -> Result<()> {
        self.disconnect().await?;

        let sync = self.ctx().sync.clone();
        for service in self.services.values() {
            sync.remove(EntityKind::Characteristic, &service.id()).await?;
        }
        sync.remove(EntityKind::Service, self.id()).await?;
        sync.remove(EntityKind::Peripheral, self.id()).await?;

        self.state = ConnectionState::Discovered;
        info!("Removed {}", self.address());
        Ok(())
    }

    /// Ask the transport for new connection parameters.
    pub async fn update_link_params(&mut self, interval: u16, latency: u16, timeout: u16) -> Result<()> {
        if interval == 0 || timeout == 0 {
            return Err(Error::invalid("interval and timeout must be non-zero"));
        }

        let params = LinkParams {
            interval,
            latency,
            timeout,
        };
        self.ctx()
            .driver
            .update_link_params(&self.link.info, params)
            .await?;
        self.link_params = Some(params);
        debug!("Link params of {} now {:?}", self.address(), params);
        Ok(())
    }

    /// Look up a characteristic by service and characteristic UUID.
    ///
    /// Both UUIDs must be `0x`-prefixed; an unknown pair yields `None`.
    pub fn find_characteristic(&self, service_uuid: &str, char_uuid: &str) -> Result<Option<&Characteristic>> {
        let service_uuid = canonical_uuid(service_uuid)?;
        let char_uuid = canonical_uuid(char_uuid)?;
        Ok(self
            .services
            .get(&service_uuid)
            .and_then(|s| s.characteristics.get(&char_uuid)))
    }

    fn characteristic(&self, service_uuid: &str, char_uuid: &str) -> Result<&Characteristic> {
        self.find_characteristic(service_uuid, char_uuid)?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no characteristic {} in service {} of {}",
                    char_uuid,
                    service_uuid,
                    self.address()
                ))
            })
    }

    /// Read a characteristic addressed by service and characteristic UUID.
    pub async fn read(&self, service_uuid: &str, char_uuid: &str) -> Result<CharValue> {
        self.characteristic(service_uuid, char_uuid)?.read().await
    }

    /// Read the user description of a characteristic.
    pub async fn read_descriptor(&self, service_uuid: &str, char_uuid: &str) -> Result<CharValue> {
        self.characteristic(service_uuid, char_uuid)?
            .read_descriptor()
            .await
    }

    /// Write a characteristic without response.
    pub async fn write(&self, service_uuid: &str, char_uuid: &str, value: CharValue) -> Result<()> {
        self.characteristic(service_uuid, char_uuid)?
            .write(value)
            .await
    }

    /// Toggle notifications or indications on a characteristic.
    pub async fn set_notify(&self, service_uuid: &str, char_uuid: &str, config: NotifyConfig) -> Result<()> {
        self.characteristic(service_uuid, char_uuid)?
            .set_notify(config)
            .await
    }

    /// Replace the notification handler of a characteristic.
    pub fn register_handler<F>(&self, service_uuid: &str, char_uuid: &str, handler: F) -> Result<()>
    where
        F: Fn(&CharValue) + Send + Sync + 'static,
    {
        self.characteristic(service_uuid, char_uuid)?
            .register_handler(handler);
        Ok(())
    }

    pub(crate) fn record(&self) -> PeripheralRecord {
        PeripheralRecord {
            id: self.id().to_string(),
            role: PERIPHERAL_ROLE.to_string(),
            addr: self.address().to_string(),
            addr_type: self.address_type(),
            state: self.state(),
            link_params: self.link_params,
        }
    }

    /// Persist the peripheral, then its services, then their
    /// characteristics, one store call at a time. Known entities are skipped.
    pub async fn save(&self) -> Result<()> {
        let sync = &self.ctx().sync;
        sync.save(&Record::Peripheral(self.record())).await?;

        let services = self
            .services
            .values()
            .map(|s| {
                let record = Record::Service(s.record());
                async move { sync.save(&record).await }.boxed()
            })
            .collect();
        run_sequentially(services).await?;

        let characteristics = self
            .characteristics()
            .map(|c| {
                let record = Record::Characteristic(c.record());
                async move { sync.save(&record).await }.boxed()
            })
            .collect();
        run_sequentially(characteristics).await?;
        Ok(())
    }

    /// Re-read every readable characteristic, persisting only changed values.
    pub async fn update(&self) -> Result<()> {
        let ops = self
            .characteristics()
            .map(|c| c.update().boxed())
            .collect();
        run_sequentially(ops).await?;
        Ok(())
    }

    /// Pair, bonding as well when `params.bond` is set.
    pub async fn authenticate(&self, params: AuthParams) -> Result<()> {
        self.ctx()
            .driver
            .authenticate(&self.link.info, params)
            .await?;
        let state = if params.bond {
            AuthState::Bonded
        } else {
            AuthState::Authenticated
        };
        self.set_auth_state(state);
        Ok(())
    }

    /// Answer a passkey request with six decimal digits.
    pub async fn passkey_update(&self, passkey: &str) -> Result<()> {
        if passkey.len() != 6 || !passkey.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid("passkey must be six decimal digits"));
        }
        self.ctx()
            .driver
            .passkey_update(&self.link.info, passkey)
            .await?;
        Ok(())
    }

    /// Re-establish encryption from keys of an earlier bonding.
    pub async fn bond(&self, mitm: bool, setting: &BondSetting) -> Result<()> {
        self.ctx()
            .driver
            .bond(&self.link.info, mitm, setting)
            .await?;
        self.set_auth_state(AuthState::Bonded);
        Ok(())
    }

    fn set_auth_state(&self, state: AuthState) {
        for characteristic in self.characteristics() {
            characteristic.set_auth_state(state);
        }
        debug!("{} auth state {:?}", self.address(), state);
    }

    /// Route this peripheral's notifications from the driver to its
    /// characteristics.
    ///
    /// Routes the characteristics known when called; spawn a new router
    /// after re-discovery. Stops when the transport reports the link lost,
    /// after which [`state`](Self::state) reads `Disconnected`.
    pub fn spawn_notification_router(&self) -> JoinHandle<()> {
        let link = self.link.clone();
        let address = self.address().to_string();
        let by_handle: HashMap<u16, Characteristic> = self
            .characteristics()
            .map(|c| (c.value_handle(), c.clone()))
            .collect();
        let mut events = self.ctx().driver.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DriverEvent::Data {
                        address: from,
                        value_handle,
                        data,
                        is_notification,
                    }) if from == address => {
                        let Some(characteristic) = by_handle.get(&value_handle) else {
                            debug!("{}: data for unknown handle {:#06x}", address, value_handle);
                            continue;
                        };
                        if let Err(e) = characteristic.deliver(&data, is_notification) {
                            warn!("{}: dropped notification of {}: {}", address, characteristic.uuid(), e);
                        }
                    }
                    Ok(DriverEvent::Disconnected { address: from }) if from == address => {
                        link.set_connection_handle(None);
                        info!("{} disconnected, notification router stopping", address);
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{}: notification router lagged, {} events lost", address, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("address", &self.address())
            .field("state", &self.state)
            .field("discovery", &self.discovery)
            .field("services", &self.services)
            .finish()
    }
}
