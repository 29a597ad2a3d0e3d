//! Persistence Module
//!
//! ## Layers
//!
//! - [`DocumentStore`] - query-addressable document store contract
//! - [`json_store`] - the bundled store: in-memory, optionally file backed
//! - [`sync`] - dedup-keyed synchronization of entities with a store

pub mod json_store;
pub mod sync;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

pub use json_store::JsonStore;
pub use sync::{EntityKind, Record, Synchronizer};

pub type Document = serde_json::Map<String, Value>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Equals(Value),
    Exists(bool),
}

/// Conjunction of per-field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<(String, Condition)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.to_string(), Condition::Equals(value.into())));
        self
    }

    pub fn exists(mut self, field: &str, present: bool) -> Self {
        self.conditions
            .push((field.to_string(), Condition::Exists(present)));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, cond)| match cond {
            Condition::Equals(expected) => doc.get(field) == Some(expected),
            Condition::Exists(present) => doc.contains_key(field) == *present,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            ascending: true,
        }
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ord = compare_values(a.get(&self.field), b.get(&self.field));
        if self.ascending {
            ord
        } else {
            ord.reverse()
        }
    }
}

// Missing fields sort first, then numbers, then strings, then everything else by its JSON text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(_)), Some(_)) => Ordering::Less,
        (Some(_), Some(Value::Number(_))) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document, assigning an `_id` when it has none.
    async fn insert(&self, doc: Document) -> StoreResult<Document>;
    async fn find_one(&self, query: &Query) -> StoreResult<Option<Document>>;
    async fn find(&self, query: &Query, sort: Option<&Sort>) -> StoreResult<Vec<Document>>;
    /// Set the patch fields on every matching document; returns how many matched.
    async fn update_multi(&self, filter: &Query, patch: &Document) -> StoreResult<usize>;
    async fn remove_multi(&self, filter: &Query) -> StoreResult<usize>;
    async fn close(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_query_eq_and_exists() {
        let service = doc(json!({ "owner": "0xabc", "uuid": "0x180f" }));
        let characteristic = doc(json!({ "owner": "0xabc", "ancestor": "0xabc/0x180f", "uuid": "0x2a19" }));

        let services = Query::new().exists("owner", true).exists("ancestor", false);
        assert!(services.matches(&service));
        assert!(!services.matches(&characteristic));

        let by_key = Query::new().eq("owner", "0xabc").eq("uuid", "0x2a19");
        assert!(by_key.matches(&characteristic));
        assert!(!by_key.matches(&service));
        assert!(Query::new().matches(&service));
    }

    #[test]
    fn test_sort_orders_strings_and_missing() {
        let sort = Sort::asc("uuid");
        let a = doc(json!({ "uuid": "0x180a" }));
        let b = doc(json!({ "uuid": "0x180f" }));
        let none = doc(json!({}));
        assert_eq!(sort.compare(&a, &b), Ordering::Less);
        assert_eq!(sort.compare(&none, &a), Ordering::Less);
        let desc = Sort {
            ascending: false,
            ..sort
        };
        assert_eq!(desc.compare(&a, &b), Ordering::Greater);
    }
}
