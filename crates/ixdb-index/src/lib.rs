//! ixdb index - series identity registration and label search
//!
//! This crate provides:
//! - Registrar: encoded identity -> TSID with monotonically allocated metric ids
//! - Inverted index rows, global and per day, over a [`ixdb_storage::KvStore`]
//! - Tag filter compilation (literal, negated, regexp) with pluggable matchers
//! - Search planner/executor with cardinality-ordered bitmap intersection
//! - Two-generation caches and the hourly active-set tracker

pub mod cache;
pub mod config;
pub mod error;
pub mod hour;
pub mod index_db;
pub mod keys;
pub mod matcher;
pub mod search;
pub mod tag_filters;

pub use cache::{CacheStats, IndexCaches, WorkingSetCache};
pub use config::IndexConfig;
pub use error::{IndexError, Result};
pub use hour::HourTracker;
pub use index_db::{IndexDb, IndexStats};
pub use matcher::ValueMatcher;
pub use search::{FilterSetPlan, FilterStep, SearchOptions, SearchPlan, StepAction};
pub use tag_filters::{FilterMode, TagFilter, TagFilters};
