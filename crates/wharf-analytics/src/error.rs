//! Error types for counter construction and persistence

use thiserror::Error;

/// Errors raised when building or rehydrating a frequency counter.
///
/// All of these are configuration mistakes; none are recoverable at
/// observation time.
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("error tolerance {tolerance} must lie in (0, support); support is {support}")]
    InvalidTolerance { support: f64, tolerance: f64 },

    #[error("support {0} must lie in (0, 1)")]
    InvalidSupport(f64),

    #[error("failure probability {0} must lie in (0, 1)")]
    InvalidFailureProbability(f64),

    #[error("unknown counter type: {0}")]
    UnknownCounterType(String),

    #[error("persisted counter document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}
