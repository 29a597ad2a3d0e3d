//! Driver Capability
//!
//! The contract every radio backend implements. The rest of the crate only
//! ever talks to a `dyn Driver`; attribute handles come back explicitly in
//! [`RawGattTable`] instead of being dug out of backend internals.

use crate::domain::models::{
    AuthParams, BondParam, BondSetting, CharacteristicRef, ConnectionHandle, DriverEvent,
    LinkParams, NotifyConfig, PeripheralInfo, RawGattTable, ResetMode, ScanParams,
};
use crate::domain::settings::DriverConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub type DriverResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait Driver: Send + Sync {
    async fn init(&self, config: &DriverConfig) -> DriverResult<()>;
    async fn close(&self) -> DriverResult<()>;
    async fn reset(&self, mode: ResetMode) -> DriverResult<()>;

    /// Run one scan window and return everything seen during it.
    async fn scan(&self) -> DriverResult<Vec<PeripheralInfo>>;
    async fn cancel_scan(&self) -> DriverResult<()>;
    async fn set_scan_params(&self, params: ScanParams) -> DriverResult<()>;
    async fn set_link_params(&self, params: LinkParams) -> DriverResult<()>;
    async fn set_bond_param(&self, param: BondParam) -> DriverResult<()>;

    /// Establish the link; the backend owns link-establishment timing.
    async fn connect(&self, peripheral: &PeripheralInfo) -> DriverResult<ConnectionHandle>;
    async fn connect_cancel(&self, peripheral: &PeripheralInfo) -> DriverResult<()>;
    async fn disconnect(&self, peripheral: &PeripheralInfo) -> DriverResult<()>;
    async fn update_link_params(
        &self,
        peripheral: &PeripheralInfo,
        params: LinkParams,
    ) -> DriverResult<()>;

    /// Walk the complete GATT table of a connected peripheral.
    async fn discover_all(&self, peripheral: &PeripheralInfo) -> DriverResult<RawGattTable>;

    async fn read(&self, characteristic: &CharacteristicRef) -> DriverResult<Vec<u8>>;
    async fn read_descriptor(&self, characteristic: &CharacteristicRef) -> DriverResult<Vec<u8>>;
    async fn write(
        &self,
        characteristic: &CharacteristicRef,
        data: &[u8],
        with_response: bool,
    ) -> DriverResult<()>;
    async fn notify(
        &self,
        characteristic: &CharacteristicRef,
        config: NotifyConfig,
    ) -> DriverResult<()>;
    async fn confirm_indication(&self, handle: ConnectionHandle) -> DriverResult<()>;

    async fn passkey_update(&self, peripheral: &PeripheralInfo, passkey: &str)
        -> DriverResult<()>;
    async fn authenticate(
        &self,
        peripheral: &PeripheralInfo,
        params: AuthParams,
    ) -> DriverResult<()>;
    async fn terminate_auth(&self, peripheral: &PeripheralInfo) -> DriverResult<()>;
    async fn bond(
        &self,
        peripheral: &PeripheralInfo,
        mitm: bool,
        setting: &BondSetting,
    ) -> DriverResult<()>;

    /// Unsolicited events: discoveries, notifications, link loss.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}
