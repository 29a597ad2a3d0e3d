//! Persistence Synchronizer
//!
//! Reconciles entities with the document store. Existence is decided only by
//! each kind's dedup key; `save` inserts when absent and otherwise leaves the
//! stored record alone. Every call round-trips to the store.

use super::{Document, DocumentStore, Query, Sort};
use crate::domain::models::{AddressType, CharProperties, CharValue, ConnectionState, LinkParams};
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Role stored on every peripheral record
pub const PERIPHERAL_ROLE: &str = "peripheral";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Peripheral,
    Service,
    Characteristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub role: String,
    pub addr: String,
    #[serde(rename = "addrType")]
    pub addr_type: AddressType,
    pub state: ConnectionState,
    #[serde(rename = "linkParams", default)]
    pub link_params: Option<LinkParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner: String,
    pub uuid: String,
    #[serde(rename = "startHdl")]
    pub start_handle: u16,
    #[serde(rename = "endHdl")]
    pub end_handle: u16,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner: String,
    pub ancestor: String,
    pub uuid: String,
    /// Value handle
    pub hdl: u16,
    pub prop: CharProperties,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub val: Option<CharValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Peripheral(PeripheralRecord),
    Service(ServiceRecord),
    Characteristic(CharacteristicRecord),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Peripheral(_) => EntityKind::Peripheral,
            Self::Service(_) => EntityKind::Service,
            Self::Characteristic(_) => EntityKind::Characteristic,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Peripheral(r) => &r.id,
            Self::Service(r) => &r.id,
            Self::Characteristic(r) => &r.id,
        }
    }

    /// Query matching this record's dedup key.
    fn dedup_query(&self) -> Query {
        match self {
            Self::Peripheral(r) => Query::new().eq("_id", r.id.as_str()),
            Self::Service(r) => Query::new()
                .eq("owner", r.owner.as_str())
                .eq("uuid", r.uuid.as_str()),
            Self::Characteristic(r) => Query::new()
                .eq("ancestor", r.ancestor.as_str())
                .eq("owner", r.owner.as_str())
                .eq("uuid", r.uuid.as_str()),
        }
    }

    fn to_document(&self) -> std::result::Result<Document, StoreError> {
        let value = match self {
            Self::Peripheral(r) => serde_json::to_value(r)?,
            Self::Service(r) => serde_json::to_value(r)?,
            Self::Characteristic(r) => serde_json::to_value(r)?,
        };
        Ok(serde_json::from_value(value)?)
    }

    fn from_document(kind: EntityKind, doc: Document) -> std::result::Result<Self, StoreError> {
        let value = Value::Object(doc);
        Ok(match kind {
            EntityKind::Peripheral => Self::Peripheral(serde_json::from_value(value)?),
            EntityKind::Service => Self::Service(serde_json::from_value(value)?),
            EntityKind::Characteristic => Self::Characteristic(serde_json::from_value(value)?),
        })
    }
}

impl EntityKind {
    fn listing(self) -> (Query, Sort) {
        match self {
            Self::Peripheral => (Query::new().eq("role", PERIPHERAL_ROLE), Sort::asc("_id")),
            Self::Service => (
                Query::new().exists("owner", true).exists("ancestor", false),
                Sort::asc("uuid"),
            ),
            Self::Characteristic => (
                Query::new().exists("owner", true).exists("ancestor", true),
                Sort::asc("uuid"),
            ),
        }
    }

    fn removal(self, id: &str) -> Query {
        match self {
            Self::Peripheral => Query::new().eq("_id", id),
            Self::Service => Query::new().eq("owner", id),
            Self::Characteristic => Query::new().eq("ancestor", id),
        }
    }
}

/// Owns the store handle for the lifetime of the application.
#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn DocumentStore>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Insert the record unless one with the same dedup key exists.
    ///
    /// Resolves with the inserted record, or with the stored one untouched.
    pub async fn save(&self, record: &Record) -> Result<Record> {
        let kind = record.kind();
        if let Some(existing) = self.store.find_one(&record.dedup_query()).await? {
            debug!("{:?} {} already stored, skipping insert", kind, record.id());
            return Ok(Record::from_document(kind, existing)?);
        }

        let inserted = self.store.insert(record.to_document()?).await?;
        info!("Stored new {:?} {}", kind, record.id());
        Ok(Record::from_document(kind, inserted)?)
    }

    pub async fn get(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let (query, sort) = kind.listing();
        let docs = self.store.find(&query, Some(&sort)).await?;
        let records = docs
            .into_iter()
            .map(|doc| Record::from_document(kind, doc))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Set `patch` on every record whose `_id` is `id`.
    pub async fn update(&self, id: &str, patch: Document) -> Result<usize> {
        let count = self
            .store
            .update_multi(&Query::new().eq("_id", id), &patch)
            .await?;
        debug!("Updated {} record(s) with id {}", count, id);
        Ok(count)
    }

    /// Delete by kind: peripheral by id, services by owner, characteristics by ancestor.
    pub async fn remove(&self, kind: EntityKind, id: &str) -> Result<usize> {
        let count = self.store.remove_multi(&kind.removal(id)).await?;
        debug!("Removed {} {:?} record(s) for {}", count, kind, id);
        Ok(count)
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }
}
