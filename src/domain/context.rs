use crate::domain::models::{CharacteristicRef, ConnectionHandle, PeripheralInfo};
use crate::error::Result;
use crate::infrastructure::bluetooth::driver::Driver;
use crate::infrastructure::codec::ValueCodec;
use crate::infrastructure::persistence::Synchronizer;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Deadline for the transport's discover-all procedure
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Collaborators every peripheral built on one controller shares.
#[derive(Clone)]
pub struct GattContext {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) codec: Arc<dyn ValueCodec>,
    pub(crate) sync: Synchronizer,
    pub(crate) discovery_timeout: Duration,
}

impl GattContext {
    pub fn new(driver: Arc<dyn Driver>, codec: Arc<dyn ValueCodec>, sync: Synchronizer) -> Self {
        Self {
            driver,
            codec,
            sync,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }
}

/// One peripheral's link. A BLE link carries a single outstanding GATT
/// transaction, so every transport call for this peripheral holds `gate`.
pub(crate) struct Link {
    pub(crate) ctx: GattContext,
    pub(crate) info: PeripheralInfo,
    handle: Mutex<Option<ConnectionHandle>>,
    gate: AsyncMutex<()>,
}

impl Link {
    pub(crate) fn new(ctx: GattContext, info: PeripheralInfo) -> Self {
        Self {
            ctx,
            info,
            handle: Mutex::new(None),
            gate: AsyncMutex::new(()),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.info.address
    }

    pub(crate) fn connection_handle(&self) -> Option<ConnectionHandle> {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_connection_handle(&self, handle: Option<ConnectionHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    /// Wait until no other GATT transaction is in flight on this link.
    pub(crate) async fn transaction(&self) -> AsyncMutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub(crate) fn char_ref(&self, service_uuid: &str, uuid: &str, value_handle: u16) -> CharacteristicRef {
        CharacteristicRef {
            address: self.info.address.clone(),
            connection_handle: self.connection_handle(),
            service_uuid: service_uuid.to_string(),
            uuid: uuid.to_string(),
            value_handle,
        }
    }
}

/// Await queued operations one after another; the first failure abandons
/// the rest of the queue.
pub(crate) async fn run_sequentially<T>(ops: Vec<BoxFuture<'_, Result<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(ops.len());
    for op in ops {
        results.push(op.await?);
    }
    Ok(results)
}
