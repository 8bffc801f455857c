//! Error types shared across the wharf workspace

use thiserror::Error;

/// Result type alias for wharf operations
pub type Result<T> = std::result::Result<T, WharfError>;

/// Main error type for wharf
#[derive(Error, Debug)]
pub enum WharfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl WharfError {
    /// Whether the error should terminate the process rather than be retried.
    ///
    /// Journal invariant violations fall in this class: the safest reaction
    /// is to restart and let crash recovery re-observe a consistent snapshot.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WharfError::InvalidTransition(_) | WharfError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(WharfError::InvalidTransition("exported_data -> waiting".into()).is_fatal());
        assert!(WharfError::Config("bad counter type".into()).is_fatal());
        assert!(!WharfError::Destination("connection refused".into()).is_fatal());
    }
}
