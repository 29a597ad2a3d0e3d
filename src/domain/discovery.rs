//! Discovery Pipeline
//!
//! ```text
//! idle ──► discovering ──► populated
//!               │
//!               └────────► failed
//! ```
//!
//! 1. Ask the driver for the complete GATT table under a deadline.
//! 2. Bind the table into services and characteristics, reusing entities
//!    that already exist so their cached values survive.
//! 3. Prime every readable characteristic one at a time: `read` the first
//!    time, `update` when the peripheral was already populated.
//! 4. Commit the new model, then persist it.

use crate::domain::characteristic::Characteristic;
use crate::domain::context::run_sequentially;
use crate::domain::models::{DiscoveryState, RawGattTable};
use crate::domain::peripheral::Peripheral;
use crate::domain::service::Service;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::protocol::normalize_uuid;
use futures::FutureExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl Peripheral {
    /// Discover all services and characteristics and prime readable values.
    ///
    /// The model only changes when every step succeeded. A store failure
    /// while persisting is returned but leaves the peripheral populated.
    pub async fn discover_services_and_chars(&mut self) -> Result<()> {
        let refresh = self.discovery == DiscoveryState::Populated;
        self.discovery = DiscoveryState::Discovering;
        info!("Discovering services of {} (refresh: {})", self.address(), refresh);

        let (services, moved) = match self.run_discovery(refresh).await {
            Ok(found) => found,
            Err(e) => {
                self.discovery = DiscoveryState::Failed;
                warn!("Discovery of {} failed: {}", self.address(), e);
                return Err(e);
            }
        };

        info!(
            "Discovered {} services on {}",
            services.len(),
            self.address()
        );
        self.services = services;
        self.discovery = DiscoveryState::Populated;

        self.save().await?;
        // saved records of moved characteristics still carry the old declaration
        let patches = moved.iter().map(|c| c.persist_declaration().boxed()).collect();
        run_sequentially(patches).await?;
        Ok(())
    }

    async fn run_discovery(&self, refresh: bool) -> Result<(BTreeMap<String, Service>, Vec<Characteristic>)> {
        let table = self.fetch_table().await?;
        let (services, moved) = self.bind(table)?;

        let primers: Vec<&Characteristic> = services
            .values()
            .flat_map(|s| s.characteristics.values())
            .filter(|c| c.properties().is_readable())
            .collect();
        debug!("Priming {} readable characteristics", primers.len());

        let ops = primers
            .into_iter()
            .map(|c| {
                if refresh {
                    async move { c.update().await.map(|_| ()) }.boxed()
                } else {
                    async move { c.read().await.map(|_| ()) }.boxed()
                }
            })
            .collect();
        run_sequentially(ops).await?;

        Ok((services, moved))
    }

    async fn fetch_table(&self) -> Result<RawGattTable> {
        let ctx = &self.link.ctx;
        let deadline = ctx.discovery_timeout;

        // The deadline also covers waiting for the link. On timeout the driver
        // call is dropped, so a late answer can never reach the model.
        let fetch = async {
            let _txn = self.link.transaction().await;
            ctx.driver.discover_all(&self.link.info).await
        };
        match tokio::time::timeout(deadline, fetch).await {
            Ok(table) => Ok(table?),
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    /// Build the service map, returning it with the characteristics whose
    /// declaration changed since the previous discovery.
    fn bind(&self, table: RawGattTable) -> Result<(BTreeMap<String, Service>, Vec<Characteristic>)> {
        let mut services = BTreeMap::new();
        let mut moved = Vec::new();

        for raw in table.services {
            let uuid = normalize_uuid(&raw.uuid)?;
            let previous = self.services.get(&uuid);
            let mut service = Service::new(self.address(), uuid.clone(), raw.start_handle, raw.end_handle);

            for raw_char in raw.characteristics {
                let char_uuid = normalize_uuid(&raw_char.uuid)?;
                let known = previous.and_then(|s| s.characteristics.get(&char_uuid));
                let characteristic = match known {
                    Some(c) if c.declared_as(raw_char.handle, raw_char.value_handle, &raw_char.properties) => {
                        c.clone()
                    }
                    _ => {
                        let fresh = Characteristic::new(
                            self.link.clone(),
                            &uuid,
                            char_uuid.clone(),
                            raw_char.handle,
                            raw_char.value_handle,
                            raw_char.properties,
                        )
                        .seeded(known.and_then(Characteristic::value));
                        if known.is_some() {
                            debug!("{} moved to handle {:#06x}", char_uuid, raw_char.value_handle);
                            moved.push(fresh.clone());
                        }
                        fresh
                    }
                };
                if service.characteristics.insert(char_uuid.clone(), characteristic).is_some() {
                    warn!("Duplicate characteristic {} in service {}", char_uuid, uuid);
                }
            }

            if services.insert(uuid.clone(), service).is_some() {
                warn!("Duplicate service {} on {}", uuid, self.address());
            }
        }

        Ok((services, moved))
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::context::GattContext;
    use crate::domain::models::{
        CharProperty, CharValue, DiscoveryState, PeripheralInfo, RawCharacteristic, RawGattTable,
        RawService,
    };
    use crate::domain::peripheral::Peripheral;
    use crate::error::Error;
    use crate::infrastructure::mock::{CountingStore, MockCodec, MockDriver};
    use crate::infrastructure::persistence::{EntityKind, Synchronizer};
    use std::sync::Arc;
    use std::time::Duration;

    const ADDRESS: &str = "0x9059af0b8159";

    fn battery_table() -> RawGattTable {
        RawGattTable {
            services: vec![RawService {
                uuid: "180F".to_string(),
                start_handle: 0x000c,
                end_handle: 0x000f,
                characteristics: vec![RawCharacteristic {
                    uuid: "2A19".to_string(),
                    handle: 0x000d,
                    value_handle: 0x000e,
                    properties: [CharProperty::Read, CharProperty::Notify].into_iter().collect(),
                }],
            }],
        }
    }

    fn multi_table() -> RawGattTable {
        let readable = || -> crate::domain::models::CharProperties {
            [CharProperty::Read].into_iter().collect()
        };
        RawGattTable {
            services: vec![
                RawService {
                    uuid: "00001800-0000-1000-8000-00805f9b34fb".to_string(),
                    start_handle: 1,
                    end_handle: 7,
                    characteristics: vec![
                        RawCharacteristic {
                            uuid: "2a00".to_string(),
                            handle: 2,
                            value_handle: 3,
                            properties: readable(),
                        },
                        RawCharacteristic {
                            uuid: "2a01".to_string(),
                            handle: 4,
                            value_handle: 5,
                            properties: readable(),
                        },
                        RawCharacteristic {
                            uuid: "2a05".to_string(),
                            handle: 6,
                            value_handle: 7,
                            properties: [CharProperty::Indicate].into_iter().collect(),
                        },
                    ],
                },
                battery_table().services.remove(0),
            ],
        }
    }

    struct Fixture {
        driver: Arc<MockDriver>,
        store: Arc<CountingStore>,
        peripheral: Peripheral,
    }

    fn fixture(table: RawGattTable) -> Fixture {
        let driver = Arc::new(MockDriver::new().with_table(table));
        let store = Arc::new(CountingStore::new());
        let ctx = GattContext::new(
            driver.clone(),
            Arc::new(MockCodec),
            Synchronizer::new(store.clone()),
        );
        let info = PeripheralInfo {
            address: ADDRESS.to_string(),
            connectable: true,
            ..Default::default()
        };
        Fixture {
            driver,
            store,
            peripheral: Peripheral::new(info, ctx),
        }
    }

    #[tokio::test]
    async fn test_battery_scenario() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![87]);

        f.peripheral.connect().await.unwrap();
        f.peripheral.discover_services_and_chars().await.unwrap();

        assert_eq!(f.peripheral.discovery_state(), DiscoveryState::Populated);
        let service = &f.peripheral.services()["0x180f"];
        assert_eq!(service.name(), Some("battery"));
        assert_eq!((service.start_handle(), service.end_handle()), (0x000c, 0x000f));
        let level = &service.characteristics()["0x2a19"];
        assert_eq!(level.value(), Some(CharValue::UInt(87)));
        assert_eq!(level.name(), Some("batteryLevel"));

        let sync = Synchronizer::new(f.store.clone());
        assert_eq!(f.store.inserts(), 3);
        assert_eq!(sync.get(EntityKind::Peripheral).await.unwrap().len(), 1);
        assert_eq!(sync.get(EntityKind::Service).await.unwrap().len(), 1);
        assert_eq!(sync.get(EntityKind::Characteristic).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_priming_is_strictly_sequential() {
        let mut f = fixture(multi_table());
        f.driver.set_op_delay(Duration::from_millis(5));
        for handle in [3, 5, 0x000e] {
            f.driver.set_payload(handle, vec![1]);
        }

        f.peripheral.discover_services_and_chars().await.unwrap();

        assert_eq!(f.driver.overlaps(), 0);
        // the indicate-only characteristic is never read
        assert_eq!(f.driver.calls_of("read"), 3);
        assert!(f.peripheral.find_characteristic("0x1800", "0x2a05").unwrap().unwrap().value().is_none());
    }

    #[tokio::test]
    async fn test_priming_failure_aborts_queue() {
        let mut f = fixture(multi_table());
        f.driver.set_payload(3, vec![1]);
        f.driver.fail_read_of(5);

        let err = f.peripheral.discover_services_and_chars().await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(f.peripheral.discovery_state(), DiscoveryState::Failed);
        assert!(f.peripheral.services().is_empty());
        // 0x2a00 read, 0x2a01 failed, battery level never attempted
        assert_eq!(f.driver.calls_of("read"), 2);
        assert_eq!(f.store.inserts(), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_fails_discovery() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![1, 2]);

        let err = f.peripheral.discover_services_and_chars().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(f.peripheral.discovery_state(), DiscoveryState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out_and_late_answer_is_ignored() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![50]);
        f.driver.set_discover_delay(Duration::from_secs(5));

        let err = f.peripheral.discover_services_and_chars().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(2)));
        assert_eq!(f.peripheral.discovery_state(), DiscoveryState::Failed);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.peripheral.services().is_empty());
        assert_eq!(f.driver.discoveries_completed(), 0);
        assert_eq!(f.driver.calls_of("read"), 0);
        assert_eq!(f.store.inserts(), 0);
    }

    #[tokio::test]
    async fn test_rediscovery_updates_instead_of_reinserting() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![90]);
        f.peripheral.discover_services_and_chars().await.unwrap();
        let first = f.peripheral.find_characteristic("0x180f", "0x2a19").unwrap().unwrap().clone();

        // unchanged value: no store write
        f.peripheral.discover_services_and_chars().await.unwrap();
        assert_eq!(f.store.updates(), 0);

        f.driver.set_payload(0x000e, vec![40]);
        f.peripheral.discover_services_and_chars().await.unwrap();
        assert_eq!(f.store.updates(), 1);
        assert_eq!(f.store.inserts(), 3);

        // same entity survived, carrying the new value
        assert_eq!(first.value(), Some(CharValue::UInt(40)));
        let records = Synchronizer::new(f.store.clone())
            .get(EntityKind::Characteristic)
            .await
            .unwrap();
        match &records[0] {
            crate::infrastructure::persistence::Record::Characteristic(r) => {
                assert_eq!(r.val, Some(CharValue::UInt(40)))
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rediscovery_follows_moved_value_handle() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![10]);
        f.peripheral.discover_services_and_chars().await.unwrap();

        let mut moved = battery_table();
        moved.services[0].characteristics[0].value_handle = 0x0020;
        f.driver.set_table(moved);
        f.driver.set_payload(0x0020, vec![55]);
        f.peripheral.discover_services_and_chars().await.unwrap();

        let level = f.peripheral.find_characteristic("0x180f", "0x2a19").unwrap().unwrap();
        assert_eq!(level.value_handle(), 0x0020);
        assert_eq!(level.value(), Some(CharValue::UInt(55)));
        assert_eq!(f.store.inserts(), 3);

        let records = Synchronizer::new(f.store.clone())
            .get(EntityKind::Characteristic)
            .await
            .unwrap();
        match &records[0] {
            crate::infrastructure::persistence::Record::Characteristic(r) => {
                assert_eq!(r.hdl, 0x0020);
                assert_eq!(r.val, Some(CharValue::UInt(55)));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_value_when_properties_change() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![70]);
        f.peripheral.discover_services_and_chars().await.unwrap();

        let mut notify_only = battery_table();
        notify_only.services[0].characteristics[0].properties =
            [CharProperty::Notify].into_iter().collect();
        f.driver.set_table(notify_only);
        f.peripheral.discover_services_and_chars().await.unwrap();

        let level = f.peripheral.find_characteristic("0x180f", "0x2a19").unwrap().unwrap();
        assert!(!level.properties().is_readable());
        assert_eq!(level.value(), Some(CharValue::UInt(70)));
        assert_eq!(f.driver.calls_of("read"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_covers_waiting_for_the_link() {
        let mut f = fixture(battery_table());
        f.driver.set_payload(0x000e, vec![10]);
        f.peripheral.discover_services_and_chars().await.unwrap();

        let level = f.peripheral.find_characteristic("0x180f", "0x2a19").unwrap().unwrap().clone();
        f.driver.set_op_delay(Duration::from_secs(10));
        let slow_read = tokio::spawn(async move { level.read().await });
        // let the read take the link first
        tokio::time::sleep(Duration::from_millis(1)).await;

        let started = tokio::time::Instant::now();
        let err = f.peripheral.discover_services_and_chars().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert_eq!(f.peripheral.discovery_state(), DiscoveryState::Failed);

        slow_read.await.unwrap().unwrap();
        assert_eq!(f.driver.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_model_populated() {
        let driver = Arc::new(MockDriver::new().with_table(battery_table()));
        driver.set_payload(0x000e, vec![12]);
        let ctx = GattContext::new(
            driver.clone(),
            Arc::new(MockCodec),
            Synchronizer::new(Arc::new(CountingStore::failing())),
        );
        let mut peripheral = Peripheral::new(
            PeripheralInfo {
                address: ADDRESS.to_string(),
                ..Default::default()
            },
            ctx,
        );

        let err = peripheral.discover_services_and_chars().await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(peripheral.discovery_state(), DiscoveryState::Populated);
        let level = peripheral.find_characteristic("0x180f", "0x2a19").unwrap().unwrap();
        assert_eq!(level.value(), Some(CharValue::UInt(12)));
    }
}
