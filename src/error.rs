//! Gateway error taxonomy.
//!
//! Validation failures are rejected synchronously and never retried. A full
//! pool is reported as a boolean failure plus a pool event rather than an
//! error. Persistence, storage and coordination failures are logged by the
//! layer that catches them.

/// Errors produced by the pool and the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed input, typically a phone number that cannot be normalized
    #[error("Validation error: {0}")]
    Validation(String),

    /// Component already shut down, or shutting down
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    /// Local credential cache failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Remote object storage or metadata database failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Instance ownership arbiter refused or was unreachable
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Protocol socket construction or send failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Requested session or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::ShuttingDown("connection pool".into());
        assert_eq!(err.to_string(), "Shutting down: connection pool");

        let err: GatewayError = std::io::Error::other("disk gone").into();
        assert_eq!(err.to_string(), "IO error: disk gone");
    }
}
