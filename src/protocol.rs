//! Wire message shapes carried by the six pub/sub topics (spec §4.1).
//!
//! Every sample travels wrapped in a [`Sample`] envelope carrying the
//! `valid_data`/`disposed` flags a DDS-like substrate attaches to each
//! delivered instance.

use serde::{Deserialize, Serialize};

/// The substrate's per-sample envelope. `valid_data` is false for a
/// reader-state transition with no payload; `disposed` marks an
/// instance-disposal event (the keyed row has been explicitly withdrawn).
#[derive(Debug, Clone)]
pub struct Sample<T> {
    pub data: T,
    pub valid_data: bool,
    pub disposed: bool,
}

impl<T> Sample<T> {
    pub fn valid(data: T) -> Self {
        Sample { data, valid_data: true, disposed: false }
    }

    pub fn disposal(data: T) -> Self {
        Sample { data, valid_data: false, disposed: true }
    }
}

/// `StoreInfo` — keyed by `store_id`, stateful. Presence advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreInfo {
    pub store_id: String,
    pub root: String,
    pub home: String,
}

/// `KeyValue` — keyed by `key`, stateful. A remote put (or, disposed, a remove).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub source_store_id: String,
    pub version: u64,
}

/// `CacheMiss` — event. A single-value resolution request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMiss {
    pub source_store_id: String,
    pub key: String,
}

/// `CacheHit` — event. `version = None` encodes the negative-hit sentinel
/// (the original's `version = -1`); a positive hit always carries a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheHit {
    pub source_store_id: String,
    pub dest_store_id: String,
    pub key: String,
    pub value: Option<String>,
    pub version: Option<u64>,
}

/// `CacheMissMv` — event. A wildcard resolution request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMissMv {
    pub source_store_id: String,
    pub key_pattern: String,
}

/// `CacheHitMv` — event. `entries = None` means "nothing matched".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheHitMv {
    pub source_store_id: String,
    pub dest_store_id: String,
    pub key_pattern: String,
    pub entries: Option<Vec<(String, String, u64)>>,
}
