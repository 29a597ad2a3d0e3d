use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Advertised address type of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

/// What the transport reports for a scanned device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub address: String,
    pub address_type: AddressType,
    pub connectable: bool,
    pub rssi: Option<i16>,
    pub local_name: Option<String>,
}

/// Opaque link identifier handed out by the transport on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    #[default]
    Discovered,
}

/// Connection interval, slave latency and supervision timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub interval: u16,
    pub window: u16,
    pub timeout_ms: u32,
    pub active: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            interval: 0x0010,
            window: 0x0010,
            timeout_ms: 2000,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    #[default]
    NoInputNoOutput,
    KeyboardDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondParam {
    PairingMode(u8),
    MitmProtection(bool),
    IoCapabilities(IoCapability),
    Bonding(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthParams {
    pub io_capability: IoCapability,
    pub mitm: bool,
    pub bond: bool,
}

/// Keys from a previous bonding, replayed to re-establish encryption.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BondSetting {
    pub ltk: Vec<u8>,
    pub div: u16,
    pub rand: Vec<u8>,
}

/// Security level reached on the link a characteristic lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    #[default]
    None,
    Authenticated,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyConfig {
    Off,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CharProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

/// Set of operations a characteristic declares.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharProperties(BTreeSet<CharProperty>);

impl CharProperties {
    pub fn contains(&self, prop: CharProperty) -> bool {
        self.0.contains(&prop)
    }

    pub fn is_readable(&self) -> bool {
        self.contains(CharProperty::Read)
    }

    pub fn iter(&self) -> impl Iterator<Item = CharProperty> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<CharProperty> for CharProperties {
    fn from_iter<I: IntoIterator<Item = CharProperty>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Typed characteristic value as produced by a [`ValueCodec`].
///
/// [`ValueCodec`]: crate::infrastructure::codec::ValueCodec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Fields(BTreeMap<String, CharValue>),
}

/// GATT table as returned by the transport's discover-all procedure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawGattTable {
    pub services: Vec<RawService>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawService {
    pub uuid: String,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: Vec<RawCharacteristic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawCharacteristic {
    pub uuid: String,
    /// Declaration handle
    pub handle: u16,
    pub value_handle: u16,
    pub properties: CharProperties,
}

/// Addresses one characteristic at the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub address: String,
    pub connection_handle: Option<ConnectionHandle>,
    pub service_uuid: String,
    pub uuid: String,
    pub value_handle: u16,
}

/// Unsolicited events raised by a driver backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Discover(PeripheralInfo),
    Data {
        address: String,
        value_handle: u16,
        data: Vec<u8>,
        is_notification: bool,
    },
    Disconnected {
        address: String,
    },
}

/// Events the controller emits to its listeners, uniform across backends.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Discover(Vec<PeripheralInfo>),
    Data {
        address: String,
        value_handle: u16,
        data: Vec<u8>,
        is_notification: bool,
    },
    Disconnected {
        address: String,
    },
}

impl From<DriverEvent> for ControllerEvent {
    fn from(event: DriverEvent) -> Self {
        match event {
            DriverEvent::Discover(info) => Self::Discover(vec![info]),
            DriverEvent::Data {
                address,
                value_handle,
                data,
                is_notification,
            } => Self::Data {
                address,
                value_handle,
                data,
                is_notification,
            },
            DriverEvent::Disconnected { address } => Self::Disconnected { address },
        }
    }
}

/// Discovery pipeline state of one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Discovering,
    Populated,
    Failed,
}
