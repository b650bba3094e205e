//! Storage error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// On-disk record failed validation (bad marker, checksum mismatch, truncated record).
    /// Not retryable: the chunk it belongs to is unusable.
    #[error("Format error in chunk {index} (header offset {header_offset}, data offset {data_offset}): {reason}")]
    Format {
        index: u64,
        header_offset: u64,
        data_offset: u64,
        reason: String,
    },

    /// Frame rejected at ingestion
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Operation not allowed in the current chunk/series state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Request descriptor failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl StorageError {
    /// True for errors that describe damaged on-disk data rather than a transient failure.
    pub fn is_format(&self) -> bool {
        matches!(self, StorageError::Format { .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for StorageError {
    fn from(err: crate::config::ConfigError) -> Self {
        StorageError::Config(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
