//! Characteristic entity and its read / write / notify / update protocol.

use crate::domain::context::Link;
use crate::domain::models::{AuthState, CharProperties, CharValue, NotifyConfig};
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::{self, USER_DESCRIPTION_UUID};
use crate::infrastructure::persistence::sync::CharacteristicRecord;
use crate::infrastructure::persistence::Document;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback invoked with every decoded notification or indication.
pub type NotifyHandler = Arc<dyn Fn(&CharValue) + Send + Sync>;

/// Shared handle to one characteristic; clones refer to the same entity.
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<Link>,
    service_uuid: String,
    uuid: String,
    name: Option<&'static str>,
    handle: u16,
    value_handle: u16,
    properties: CharProperties,
    value: Mutex<Option<CharValue>>,
    auth_state: Mutex<AuthState>,
    handler: Mutex<NotifyHandler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Characteristic {
    pub(crate) fn new(
        link: Arc<Link>,
        service_uuid: &str,
        uuid: String,
        handle: u16,
        value_handle: u16,
        properties: CharProperties,
    ) -> Self {
        let name = protocol::characteristic_name(&uuid);
        let noop: NotifyHandler = Arc::new(|_: &CharValue| {});
        Self {
            inner: Arc::new(Inner {
                link,
                service_uuid: service_uuid.to_string(),
                uuid,
                name,
                handle,
                value_handle,
                properties,
                value: Mutex::new(None),
                auth_state: Mutex::new(AuthState::None),
                handler: Mutex::new(noop),
            }),
        }
    }

    /// Whether this entity still describes the given declaration.
    pub(crate) fn declared_as(&self, handle: u16, value_handle: u16, properties: &CharProperties) -> bool {
        self.inner.handle == handle
            && self.inner.value_handle == value_handle
            && &self.inner.properties == properties
    }

    /// Carry a previously cached value over into a freshly built entity.
    pub(crate) fn seeded(self, value: Option<CharValue>) -> Self {
        *lock(&self.inner.value) = value;
        self
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn service_uuid(&self) -> &str {
        &self.inner.service_uuid
    }

    pub fn name(&self) -> Option<&'static str> {
        self.inner.name
    }

    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    pub fn value_handle(&self) -> u16 {
        self.inner.value_handle
    }

    pub fn properties(&self) -> &CharProperties {
        &self.inner.properties
    }

    /// Last known value.
    pub fn value(&self) -> Option<CharValue> {
        lock(&self.inner.value).clone()
    }

    pub fn auth_state(&self) -> AuthState {
        *lock(&self.inner.auth_state)
    }

    pub(crate) fn set_auth_state(&self, state: AuthState) {
        *lock(&self.inner.auth_state) = state;
    }

    pub fn service_id(&self) -> String {
        format!("{}/{}", self.inner.link.address(), self.inner.service_uuid)
    }

    /// Persisted record id.
    pub fn id(&self) -> String {
        format!("{}/{}", self.service_id(), self.inner.uuid)
    }

    /// Replace the notification handler.
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(&CharValue) + Send + Sync + 'static,
    {
        *lock(&self.inner.handler) = Arc::new(handler);
    }

    fn char_ref(&self) -> crate::domain::models::CharacteristicRef {
        self.inner
            .link
            .char_ref(&self.inner.service_uuid, &self.inner.uuid, self.inner.value_handle)
    }

    fn decode(&self, uuid: &str, data: &[u8]) -> Result<CharValue> {
        Ok(self.inner.link.ctx.codec.decode(uuid, data)?)
    }

    fn store_value(&self, value: CharValue) -> Option<CharValue> {
        lock(&self.inner.value).replace(value)
    }

    /// Read the value from the peripheral, decode it and cache it.
    pub async fn read(&self) -> Result<CharValue> {
        let data = {
            let _txn = self.inner.link.transaction().await;
            self.inner.link.ctx.driver.read(&self.char_ref()).await?
        };
        trace!("Read {} bytes from {}: {:02X?}", data.len(), self.id(), data);

        let value = self.decode(&self.inner.uuid, &data)?;
        self.store_value(value.clone());
        debug!("{} = {:?}", self.id(), value);
        Ok(value)
    }

    /// Read and decode the user description descriptor.
    pub async fn read_descriptor(&self) -> Result<CharValue> {
        let data = {
            let _txn = self.inner.link.transaction().await;
            self.inner.link.ctx.driver.read_descriptor(&self.char_ref()).await?
        };
        self.decode(USER_DESCRIPTION_UUID, &data)
    }

    /// Encode and send `value` without requesting a response.
    ///
    /// Completes once the transport accepted the write; the cached value is
    /// set to what was sent.
    pub async fn write(&self, value: CharValue) -> Result<()> {
        let data = self.inner.link.ctx.codec.encode(&self.inner.uuid, &value)?;
        {
            let _txn = self.inner.link.transaction().await;
            self.inner
                .link
                .ctx
                .driver
                .write(&self.char_ref(), &data, false)
                .await?;
        }
        debug!("Wrote {:?} to {}", value, self.id());
        self.store_value(value);
        Ok(())
    }

    /// Toggle notification or indication delivery at the transport.
    pub async fn set_notify(&self, config: NotifyConfig) -> Result<()> {
        let _txn = self.inner.link.transaction().await;
        self.inner
            .link
            .ctx
            .driver
            .notify(&self.char_ref(), config)
            .await?;
        debug!("{:?} on {}", config, self.id());
        Ok(())
    }

    /// Re-read the value and persist it only when it changed.
    ///
    /// Returns whether a store write was issued. Characteristics without the
    /// read property are left alone.
    pub async fn update(&self) -> Result<bool> {
        if !self.inner.properties.is_readable() {
            return Ok(false);
        }

        let previous = self.value();
        let current = self.read().await?;
        if previous.as_ref() == Some(&current) {
            trace!("{} unchanged, skipping store write", self.id());
            return Ok(false);
        }

        self.persist_value(&current).await?;
        Ok(true)
    }

    async fn persist_value(&self, value: &CharValue) -> Result<usize> {
        let mut patch = Document::new();
        patch.insert(
            "val".to_string(),
            serde_json::to_value(value).map_err(crate::error::StoreError::from)?,
        );
        self.inner.link.ctx.sync.update(&self.id(), patch).await
    }

    /// Rewrite the stored handle and properties after the declaration moved.
    pub(crate) async fn persist_declaration(&self) -> Result<usize> {
        let mut patch = Document::new();
        patch.insert("hdl".to_string(), self.inner.value_handle.into());
        patch.insert(
            "prop".to_string(),
            serde_json::to_value(&self.inner.properties).map_err(crate::error::StoreError::from)?,
        );
        self.inner.link.ctx.sync.update(&self.id(), patch).await
    }

    /// Handle a data event from the transport.
    ///
    /// Notifications and indications are decoded, cached and passed to the
    /// handler; the store write then runs as a detached task whose failure is
    /// only logged. Returns that task, or `None` when the event was not a
    /// notification.
    pub fn deliver(&self, data: &[u8], is_notification: bool) -> Result<Option<JoinHandle<()>>> {
        if !is_notification {
            return Ok(None);
        }

        let value = self.decode(&self.inner.uuid, data)?;
        self.store_value(value.clone());

        let handler = lock(&self.inner.handler).clone();
        handler(&value);

        let this = self.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = this.persist_value(&value).await {
                warn!("Failed to persist notified value of {}: {}", this.id(), e);
            }
        })))
    }

    pub(crate) fn record(&self) -> CharacteristicRecord {
        CharacteristicRecord {
            id: self.id(),
            owner: self.inner.link.address().to_string(),
            ancestor: self.service_id(),
            uuid: self.inner.uuid.clone(),
            hdl: self.inner.value_handle,
            prop: self.inner.properties.clone(),
            name: self.inner.name.map(str::to_string),
            val: self.value(),
        }
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.inner.uuid)
            .field("name", &self.inner.name)
            .field("value_handle", &self.inner.value_handle)
            .field("properties", &self.inner.properties)
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::GattContext;
    use crate::domain::models::{CharProperty, PeripheralInfo};
    use crate::error::Error;
    use crate::infrastructure::mock::{CountingStore, MockCodec, MockDriver};
    use crate::infrastructure::persistence::{EntityKind, Record, Synchronizer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const VALUE_HANDLE: u16 = 0x000e;

    struct Fixture {
        driver: Arc<MockDriver>,
        store: Arc<CountingStore>,
        sync: Synchronizer,
        battery: Characteristic,
    }

    fn fixture(props: &[CharProperty]) -> Fixture {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(CountingStore::new());
        let sync = Synchronizer::new(store.clone());
        let ctx = GattContext::new(driver.clone(), Arc::new(MockCodec), sync.clone());
        let info = PeripheralInfo {
            address: "0x9059af0b8159".to_string(),
            ..Default::default()
        };
        let link = Arc::new(Link::new(ctx, info));
        let battery = Characteristic::new(
            link,
            "0x180f",
            "0x2a19".to_string(),
            0x000d,
            VALUE_HANDLE,
            props.iter().copied().collect(),
        );
        Fixture {
            driver,
            store,
            sync,
            battery,
        }
    }

    async fn stored_value(sync: &Synchronizer) -> Option<CharValue> {
        match sync.get(EntityKind::Characteristic).await.unwrap().pop() {
            Some(Record::Characteristic(r)) => r.val,
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_identity_and_name() {
        let f = fixture(&[CharProperty::Read]);
        assert_eq!(f.battery.id(), "0x9059af0b8159/0x180f/0x2a19");
        assert_eq!(f.battery.service_id(), "0x9059af0b8159/0x180f");
        assert_eq!(f.battery.name(), Some("batteryLevel"));
        assert_eq!(f.battery.value(), None);
    }

    #[tokio::test]
    async fn test_read_decodes_and_caches() {
        let f = fixture(&[CharProperty::Read]);
        f.driver.set_payload(VALUE_HANDLE, vec![87]);

        assert_eq!(f.battery.read().await.unwrap(), CharValue::UInt(87));
        assert_eq!(f.battery.value(), Some(CharValue::UInt(87)));
    }

    #[tokio::test]
    async fn test_decode_failure_leaves_cache_alone() {
        let f = fixture(&[CharProperty::Read]);
        f.driver.set_payload(VALUE_HANDLE, vec![]);

        let err = f.battery.read().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(f.battery.value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_link() {
        let f = fixture(&[CharProperty::Read]);
        f.driver.set_payload(VALUE_HANDLE, vec![50]);
        f.driver.set_op_delay(Duration::from_millis(30));

        let other = f.battery.clone();
        let (a, b, c) = tokio::join!(
            f.battery.read(),
            other.read(),
            f.battery.set_notify(NotifyConfig::Notify)
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(f.driver.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_read_descriptor_is_user_description() {
        let f = fixture(&[CharProperty::Read]);
        f.driver.set_payload(VALUE_HANDLE + 1, b"Main cell".to_vec());

        let description = f.battery.read_descriptor().await.unwrap();
        assert_eq!(description, CharValue::Text("Main cell".to_string()));
        assert_eq!(f.battery.value(), None);
    }

    #[tokio::test]
    async fn test_write_sends_without_response_and_caches() {
        let f = fixture(&[CharProperty::Read, CharProperty::Write]);

        f.battery.write(CharValue::UInt(42)).await.unwrap();
        assert_eq!(f.driver.writes(), vec![(VALUE_HANDLE, vec![42], false)]);
        assert_eq!(f.battery.value(), Some(CharValue::UInt(42)));
    }

    #[tokio::test]
    async fn test_unencodable_write_never_reaches_driver() {
        let f = fixture(&[CharProperty::Write]);

        let err = f.battery.write(CharValue::Bool(true)).await.unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
        assert_eq!(f.driver.calls_of("write"), 0);
        assert_eq!(f.battery.value(), None);
    }

    #[tokio::test]
    async fn test_set_notify_reaches_driver() {
        let f = fixture(&[CharProperty::Notify]);
        f.battery.set_notify(NotifyConfig::Indicate).await.unwrap();
        assert_eq!(f.driver.notify_configs(), vec![(VALUE_HANDLE, NotifyConfig::Indicate)]);
    }

    #[tokio::test]
    async fn test_update_skips_unreadable() {
        let f = fixture(&[CharProperty::Notify]);
        assert!(!f.battery.update().await.unwrap());
        assert_eq!(f.driver.calls_of("read"), 0);
    }

    #[tokio::test]
    async fn test_update_writes_store_only_on_change() {
        let f = fixture(&[CharProperty::Read]);
        f.sync.save(&Record::Characteristic(f.battery.record())).await.unwrap();

        f.driver.set_payload(VALUE_HANDLE, vec![90]);
        assert!(f.battery.update().await.unwrap());
        assert!(!f.battery.update().await.unwrap());
        assert_eq!(f.store.updates(), 1);

        f.driver.set_payload(VALUE_HANDLE, vec![89]);
        assert!(f.battery.update().await.unwrap());
        assert_eq!(f.store.updates(), 2);
        assert_eq!(stored_value(&f.sync).await, Some(CharValue::UInt(89)));
    }

    #[tokio::test]
    async fn test_notification_reaches_handler_and_store() {
        let f = fixture(&[CharProperty::Read, CharProperty::Notify]);
        f.sync.save(&Record::Characteristic(f.battery.record())).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.battery
            .register_handler(move |v: &CharValue| lock(&sink).push(v.clone()));

        let persist = f.battery.deliver(&[73], true).unwrap().unwrap();
        assert_eq!(*lock(&seen), vec![CharValue::UInt(73)]);
        assert_eq!(f.battery.value(), Some(CharValue::UInt(73)));

        persist.await.unwrap();
        assert_eq!(stored_value(&f.sync).await, Some(CharValue::UInt(73)));
    }

    #[tokio::test]
    async fn test_read_response_event_is_ignored() {
        let f = fixture(&[CharProperty::Read]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.battery.register_handler(move |_: &CharValue| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(f.battery.deliver(&[10], false).unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.battery.value(), None);
    }

    #[tokio::test]
    async fn test_notification_store_failure_is_swallowed() {
        let driver = Arc::new(MockDriver::new());
        let ctx = GattContext::new(
            driver,
            Arc::new(MockCodec),
            Synchronizer::new(Arc::new(CountingStore::failing())),
        );
        let link = Arc::new(Link::new(ctx, PeripheralInfo::default()));
        let battery = Characteristic::new(
            link,
            "0x180f",
            "0x2a19".to_string(),
            0x000d,
            VALUE_HANDLE,
            [CharProperty::Notify].into_iter().collect(),
        );

        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        battery.register_handler(move |_: &CharValue| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let persist = battery.deliver(&[5], true).unwrap().unwrap();
        assert!(persist.await.is_ok());
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(battery.value(), Some(CharValue::UInt(5)));
    }
}
