//! Error taxonomy shared by the entity model, discovery and persistence.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a driver backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct TransportError {
    pub operation: &'static str,
    pub reason: String,
}

impl TransportError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// The codec could not interpret a payload for a UUID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot decode value of {uuid}: {reason}")]
pub struct DecodeError {
    pub uuid: String,
    pub reason: String,
}

/// The codec could not produce bytes for a UUID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot encode value for {uuid}: {reason}")]
pub struct EncodeError {
    pub uuid: String,
    pub reason: String,
}

/// Persistence round-trip failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
