//! ChunkLog Error Types

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for ChunkLog operations
pub type Result<T> = std::result::Result<T, Error>;

/// ChunkLog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Corruption errors
    #[error("Corrupt chunk file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Hash validation failed for chunk file {}", path.display())]
    HashValidation { path: PathBuf },

    #[error("Invalid chunk format: {0}")]
    InvalidFormat(String),

    #[error("Database corrupt: {0}")]
    CorruptDatabase(String),

    #[error("Checkpoint {name} ({position}) is ahead of the writer checkpoint ({writer})")]
    ReaderCheckpointHigherThanWriter {
        name: String,
        position: i64,
        writer: i64,
    },

    // Record errors
    #[error("Record of {size} bytes does not fit in a chunk of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: i64 },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // Validation errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unable to read past end of chunk: position {position}, limit {limit}")]
    ReadPastEnd { position: i64, limit: i64 },

    // Concurrency errors
    #[error("Chunk file is being deleted")]
    FileBeingDeleted,

    #[error("No reader available for chunk {0}")]
    ReaderPoolExhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Invariant errors
    #[error("Chunk #{0} is not present")]
    ChunkNotPresent(i32),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a corruption error for a chunk file
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Check if this error means the database files cannot be trusted.
    /// Startup must stop on these rather than truncate data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupt { .. }
                | Error::HashValidation { .. }
                | Error::InvalidFormat(_)
                | Error::CorruptDatabase(_)
                | Error::ReaderCheckpointHigherThanWriter { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::FileBeingDeleted | Error::ReaderPoolExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::FileBeingDeleted.is_retryable());
        assert!(!Error::FileBeingDeleted.is_corruption());

        let err = Error::corrupt(Path::new("/tmp/chunk-000000.000000"), "bad footer");
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad footer"));

        assert!(!Error::ChunkNotPresent(3).is_corruption());
    }
}
