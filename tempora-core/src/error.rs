//! Error types for Tempora

use thiserror::Error;

/// Result type alias for Tempora operations
pub type Result<T> = std::result::Result<T, TemporaError>;

/// Tempora error types
#[derive(Error, Debug)]
pub enum TemporaError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed ingestion payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// No tier set matches a metric key
    #[error("Routing error: {0}")]
    Routing(String),

    /// Backing store call failed
    #[error("Store error: {0}")]
    Store(String),

    /// Bad query parameters supplied by a client
    #[error("Query input error: {0}")]
    QueryInput(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TemporaError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TemporaError::Io(_) | TemporaError::Store(_))
    }

    /// Check if the error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(self, TemporaError::QueryInput(_) | TemporaError::Decode(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TemporaError::Corruption(_) | TemporaError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TemporaError::Store("timeout".into()).is_retryable());
        assert!(!TemporaError::Config("bad".into()).is_retryable());
        assert!(!TemporaError::Store("timeout".into()).is_client_error());
        assert!(TemporaError::Decode("bad line".into()).is_client_error());
        assert!(TemporaError::QueryInput("missing shardKey".into()).is_client_error());
        assert!(TemporaError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
    }
}
