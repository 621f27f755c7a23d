//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Value type does not match the established series type
    #[error("Type mismatch on {series}: expected {expected}, got {actual}")]
    TypeMismatch {
        series: String,
        expected: String,
        actual: String,
    },

    /// Device time ranges of a sequence file span more than one partition
    #[error("Partition violation: {0}")]
    PartitionViolation(String),

    /// Operation not allowed in the current writer or buffer state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Ingestion refused after a flush failure
    #[error("Write rejected: a previous flush failed")]
    WriteRejected,

    /// Flush failed
    #[error("Flush error: {0}")]
    Flush(String),

    /// Flush stopped because a sibling stage failed
    #[error("Flush cancelled")]
    FlushCancelled,

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Merge error
    #[error("Merge error: {0}")]
    Merge(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_) | StrataError::WriteRejected)
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_) | StrataError::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Config(e.to_string())
    }
}
