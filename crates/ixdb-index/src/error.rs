//! Index error types

use ixdb_core::{CoreError, MetricId, Scope};
use ixdb_storage::StorageError;
use thiserror::Error;

/// Index errors
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Search matches more than {limit} series: {filters}")]
    TooManyMatches { limit: usize, filters: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Series {metric_id} not found in scope {scope}")]
    NotFound { scope: Scope, metric_id: MetricId },

    #[error("Search deadline exceeded")]
    DeadlineExceeded,
}

/// Result type for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

impl From<CoreError> for IndexError {
    fn from(e: CoreError) -> Self {
        IndexError::InvalidIdentity(e.to_string())
    }
}

impl From<StorageError> for IndexError {
    fn from(e: StorageError) -> Self {
        IndexError::StoreUnavailable(e.to_string())
    }
}
