//! Error types for the indexing engine.

use keyindex_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while maintaining an index
#[derive(Error, Debug)]
pub enum IndexError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A source collaborator failed to produce a value or change set
    #[error("Source error: {0}")]
    Source(String),

    /// The user mapping function failed
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Progress marker load/save issues
    #[error("Progress marker error: {0}")]
    Progress(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A spawned task panicked or was aborted
    #[error("Task join error: {0}")]
    Join(String),

    /// The operation was cancelled before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::Join(err.to_string())
    }
}

impl From<config::ConfigError> for IndexError {
    fn from(err: config::ConfigError) -> Self {
        IndexError::Config(err.to_string())
    }
}
