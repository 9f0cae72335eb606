//! Error types for ixdb-core

use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Empty tag key")]
    EmptyTagKey,

    #[error("Duplicate tag key: {0}")]
    DuplicateTagKey(String),

    #[error("Tags are not sorted by key")]
    UnsortedTags,

    #[error("Invalid TSID: {0}")]
    InvalidTsid(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
