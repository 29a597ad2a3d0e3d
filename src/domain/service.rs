use crate::domain::characteristic::Characteristic;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::persistence::sync::ServiceRecord;
use std::collections::BTreeMap;

/// A primary service of a discovered peripheral.
#[derive(Debug, Clone)]
pub struct Service {
    owner: String,
    uuid: String,
    name: Option<&'static str>,
    start_handle: u16,
    end_handle: u16,
    pub(crate) characteristics: BTreeMap<String, Characteristic>,
}

impl Service {
    pub(crate) fn new(owner: &str, uuid: String, start_handle: u16, end_handle: u16) -> Self {
        let name = protocol::service_name(&uuid);
        Self {
            owner: owner.to_string(),
            uuid,
            name,
            start_handle,
            end_handle,
            characteristics: BTreeMap::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn start_handle(&self) -> u16 {
        self.start_handle
    }

    pub fn end_handle(&self) -> u16 {
        self.end_handle
    }

    /// Characteristics keyed by canonical UUID.
    pub fn characteristics(&self) -> &BTreeMap<String, Characteristic> {
        &self.characteristics
    }

    pub fn characteristic(&self, uuid: &str) -> Option<&Characteristic> {
        self.characteristics.get(uuid)
    }

    /// Persisted record id, also the `ancestor` of its characteristics.
    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.uuid)
    }

    pub(crate) fn record(&self) -> ServiceRecord {
        ServiceRecord {
            id: self.id(),
            owner: self.owner.clone(),
            uuid: self.uuid.clone(),
            start_handle: self.start_handle,
            end_handle: self.end_handle,
            name: self.name.map(str::to_string),
        }
    }
}
