//! Central-role BLE library: discover peripherals, walk their GATT tables
//! into a typed entity model, and mirror that model into a document store.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::characteristic::{Characteristic, NotifyHandler};
pub use domain::context::{GattContext, DEFAULT_DISCOVERY_TIMEOUT};
pub use domain::peripheral::Peripheral;
pub use domain::service::Service;
pub use domain::settings::{Settings, SettingsService};
pub use error::{Error, Result};
pub use infrastructure::bluetooth::{Backend, Controller, Driver};
pub use infrastructure::codec::{RawCodec, ValueCodec};
pub use infrastructure::persistence::{DocumentStore, JsonStore, Synchronizer};
