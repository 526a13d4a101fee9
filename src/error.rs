//! Crate-wide error type.
//!
//! Per the coherence model's error policy: transient conditions (no peers
//! yet, an unresolved miss, a version regression, a write to a meta-resource)
//! are never raised as errors — they come back as `None`/`false`/`vec![]`.
//! Only failures that are fatal to a store surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CastellanError {
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("messaging substrate failed to initialize: {0}")]
    Transport(String),
}
