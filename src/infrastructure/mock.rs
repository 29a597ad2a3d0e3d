//! Test doubles that stand in for a radio, a value catalog and a database.
//!
//! [`MockDriver`] serves a scripted GATT table and per-handle payloads,
//! records every call, and counts any GATT call issued while another is
//! still in flight (and fails it).

use crate::domain::models::{
    AuthParams, BondParam, BondSetting, CharValue, CharacteristicRef, ConnectionHandle,
    DriverEvent, LinkParams, NotifyConfig, PeripheralInfo, RawGattTable, ResetMode, ScanParams,
};
use crate::domain::settings::DriverConfig;
use crate::error::{DecodeError, EncodeError, StoreError, TransportError};
use crate::infrastructure::bluetooth::driver::{Driver, DriverResult};
use crate::infrastructure::codec::ValueCodec;
use crate::infrastructure::persistence::{Document, DocumentStore, JsonStore, Query, Sort, StoreResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MockDriver {
    table: Mutex<RawGattTable>,
    payloads: Mutex<HashMap<u16, Vec<u8>>>,
    failing_reads: Mutex<HashSet<u16>>,
    failing_ops: Mutex<HashSet<&'static str>>,
    scan_results: Mutex<Vec<PeripheralInfo>>,
    discover_delay: Mutex<Option<Duration>>,
    op_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<&'static str>>,
    writes: Mutex<Vec<(u16, Vec<u8>, bool)>>,
    notify_configs: Mutex<Vec<(u16, NotifyConfig)>>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    discoveries: AtomicUsize,
    next_handle: AtomicU16,
    events: broadcast::Sender<DriverEvent>,
}

/// Clears the in-flight flag even when the call is dropped mid-way.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            table: Mutex::new(RawGattTable::default()),
            payloads: Mutex::new(HashMap::new()),
            failing_reads: Mutex::new(HashSet::new()),
            failing_ops: Mutex::new(HashSet::new()),
            scan_results: Mutex::new(Vec::new()),
            discover_delay: Mutex::new(None),
            op_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            notify_configs: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            discoveries: AtomicUsize::new(0),
            next_handle: AtomicU16::new(0x0040),
            events,
        }
    }

    pub fn with_table(self, table: RawGattTable) -> Self {
        *lock(&self.table) = table;
        self
    }

    /// Replace the table served by later discoveries.
    pub fn set_table(&self, table: RawGattTable) {
        *lock(&self.table) = table;
    }

    pub fn set_payload(&self, value_handle: u16, data: Vec<u8>) {
        lock(&self.payloads).insert(value_handle, data);
    }

    pub fn fail_read_of(&self, value_handle: u16) {
        lock(&self.failing_reads).insert(value_handle);
    }

    /// Make every call of the named operation fail.
    pub fn fail(&self, operation: &'static str) {
        lock(&self.failing_ops).insert(operation);
    }

    pub fn set_scan_results(&self, results: Vec<PeripheralInfo>) {
        *lock(&self.scan_results) = results;
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        *lock(&self.discover_delay) = Some(delay);
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *lock(&self.op_delay) = Some(delay);
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, operation: &str) -> usize {
        lock(&self.calls).iter().filter(|c| **c == operation).count()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u8>, bool)> {
        lock(&self.writes).clone()
    }

    pub fn notify_configs(&self) -> Vec<(u16, NotifyConfig)> {
        lock(&self.notify_configs).clone()
    }

    /// GATT calls that started while another one was in flight.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn discoveries_completed(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &'static str) -> DriverResult<()> {
        lock(&self.calls).push(operation);
        if lock(&self.failing_ops).contains(operation) {
            return Err(TransportError::new(operation, "scripted failure"));
        }
        Ok(())
    }

    /// Enter a GATT transaction; fails if one is already running.
    fn enter(&self, operation: &'static str) -> DriverResult<InFlight<'_>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::new(operation, "GATT transaction already in flight"));
        }
        Ok(InFlight(&self.in_flight))
    }

    async fn settle(&self) {
        let delay = *lock(&self.op_delay);
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn init(&self, _config: &DriverConfig) -> DriverResult<()> {
        self.record("init")
    }

    async fn close(&self) -> DriverResult<()> {
        self.record("close")
    }

    async fn reset(&self, _mode: ResetMode) -> DriverResult<()> {
        self.record("reset")
    }

    async fn scan(&self) -> DriverResult<Vec<PeripheralInfo>> {
        self.record("scan")?;
        Ok(lock(&self.scan_results).clone())
    }

    async fn cancel_scan(&self) -> DriverResult<()> {
        self.record("cancel_scan")
    }

    async fn set_scan_params(&self, _params: ScanParams) -> DriverResult<()> {
        self.record("set_scan_params")
    }

    async fn set_link_params(&self, _params: LinkParams) -> DriverResult<()> {
        self.record("set_link_params")
    }

    async fn set_bond_param(&self, _param: BondParam) -> DriverResult<()> {
        self.record("set_bond_param")
    }

    async fn connect(&self, _peripheral: &PeripheralInfo) -> DriverResult<ConnectionHandle> {
        self.record("connect")?;
        Ok(ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn connect_cancel(&self, _peripheral: &PeripheralInfo) -> DriverResult<()> {
        self.record("connect_cancel")
    }

    async fn disconnect(&self, peripheral: &PeripheralInfo) -> DriverResult<()> {
        self.record("disconnect")?;
        self.emit(DriverEvent::Disconnected {
            address: peripheral.address.clone(),
        });
        Ok(())
    }

    async fn update_link_params(
        &self,
        _peripheral: &PeripheralInfo,
        _params: LinkParams,
    ) -> DriverResult<()> {
        self.record("update_link_params")
    }

    async fn discover_all(&self, _peripheral: &PeripheralInfo) -> DriverResult<RawGattTable> {
        self.record("discover_all")?;
        let _txn = self.enter("discover_all")?;
        let delay = *lock(&self.discover_delay);
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => self.settle().await,
        }
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.table).clone())
    }

    async fn read(&self, characteristic: &CharacteristicRef) -> DriverResult<Vec<u8>> {
        self.record("read")?;
        let _txn = self.enter("read")?;
        self.settle().await;
        if lock(&self.failing_reads).contains(&characteristic.value_handle) {
            return Err(TransportError::new("read", "attribute not readable"));
        }
        lock(&self.payloads)
            .get(&characteristic.value_handle)
            .cloned()
            .ok_or_else(|| TransportError::new("read", "no payload scripted"))
    }

    async fn read_descriptor(&self, characteristic: &CharacteristicRef) -> DriverResult<Vec<u8>> {
        self.record("read_descriptor")?;
        let _txn = self.enter("read_descriptor")?;
        self.settle().await;
        // user description lives right after the value attribute
        lock(&self.payloads)
            .get(&(characteristic.value_handle + 1))
            .cloned()
            .ok_or_else(|| TransportError::new("read_descriptor", "no descriptor scripted"))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicRef,
        data: &[u8],
        with_response: bool,
    ) -> DriverResult<()> {
        self.record("write")?;
        let _txn = self.enter("write")?;
        self.settle().await;
        lock(&self.writes).push((characteristic.value_handle, data.to_vec(), with_response));
        Ok(())
    }

    async fn notify(
        &self,
        characteristic: &CharacteristicRef,
        config: NotifyConfig,
    ) -> DriverResult<()> {
        self.record("notify")?;
        let _txn = self.enter("notify")?;
        self.settle().await;
        lock(&self.notify_configs).push((characteristic.value_handle, config));
        Ok(())
    }

    async fn confirm_indication(&self, _handle: ConnectionHandle) -> DriverResult<()> {
        self.record("confirm_indication")
    }

    async fn passkey_update(
        &self,
        _peripheral: &PeripheralInfo,
        _passkey: &str,
    ) -> DriverResult<()> {
        self.record("passkey_update")
    }

    async fn authenticate(
        &self,
        _peripheral: &PeripheralInfo,
        _params: AuthParams,
    ) -> DriverResult<()> {
        self.record("authenticate")
    }

    async fn terminate_auth(&self, _peripheral: &PeripheralInfo) -> DriverResult<()> {
        self.record("terminate_auth")
    }

    async fn bond(
        &self,
        _peripheral: &PeripheralInfo,
        _mitm: bool,
        _setting: &BondSetting,
    ) -> DriverResult<()> {
        self.record("bond")
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

/// Knows battery level (`0x2a19`, one byte) and user descriptions
/// (`0x2901`, UTF-8); everything else is raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockCodec;

impl ValueCodec for MockCodec {
    fn decode(&self, uuid: &str, data: &[u8]) -> Result<CharValue, DecodeError> {
        let fail = |reason: &str| DecodeError {
            uuid: uuid.to_string(),
            reason: reason.to_string(),
        };
        match uuid {
            "0x2a19" => match data {
                [level] => Ok(CharValue::UInt(u64::from(*level))),
                _ => Err(fail("battery level is one byte")),
            },
            "0x2901" => String::from_utf8(data.to_vec())
                .map(CharValue::Text)
                .map_err(|_| fail("description is not UTF-8")),
            _ => Ok(CharValue::Bytes(data.to_vec())),
        }
    }

    fn encode(&self, uuid: &str, value: &CharValue) -> Result<Vec<u8>, EncodeError> {
        match (uuid, value) {
            ("0x2a19", CharValue::UInt(level)) if *level <= 100 => Ok(vec![*level as u8]),
            (_, CharValue::Bytes(bytes)) => Ok(bytes.clone()),
            (_, CharValue::Text(text)) => Ok(text.as_bytes().to_vec()),
            _ => Err(EncodeError {
                uuid: uuid.to_string(),
                reason: format!("unsupported value {:?}", value),
            }),
        }
    }
}

/// In-memory store that counts writes and can be told to fail every call.
pub struct CountingStore {
    inner: JsonStore,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    fail: bool,
}

impl Default for CountingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: JsonStore::in_memory(),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.fail {
            return Err(StoreError::Io(std::io::Error::other("store unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn insert(&self, doc: Document) -> StoreResult<Document> {
        self.check()?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(doc).await
    }

    async fn find_one(&self, query: &Query) -> StoreResult<Option<Document>> {
        self.check()?;
        self.inner.find_one(query).await
    }

    async fn find(&self, query: &Query, sort: Option<&Sort>) -> StoreResult<Vec<Document>> {
        self.check()?;
        self.inner.find(query, sort).await
    }

    async fn update_multi(&self, filter: &Query, patch: &Document) -> StoreResult<usize> {
        self.check()?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_multi(filter, patch).await
    }

    async fn remove_multi(&self, filter: &Query) -> StoreResult<usize> {
        self.check()?;
        self.inner.remove_multi(filter).await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}
