//! Index configuration

use serde::{Deserialize, Serialize};

/// Index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Entries per generation of the identity -> TSID cache
    pub tsid_cache_capacity: usize,
    /// Entries per generation of the metric id -> identity cache
    pub metric_name_cache_capacity: usize,
    /// Searches spanning at most this many days use the per-day rows
    pub max_days_for_per_day_index: u64,
    /// Metric ids reserved per persisted high-water mark update
    pub id_block_size: u64,
    /// Serialize first-time registration per identity
    pub strict_registration: bool,
    /// Number of lock stripes used by strict registration
    pub registration_lock_stripes: usize,
    /// Per-filter memo size for regexp match results
    pub regex_match_cache_size: usize,
    /// Row scans for cardinality estimates stop at this count
    pub estimate_scan_cap: u64,
    /// Maximum number of cached cardinality estimates
    pub estimate_cache_capacity: usize,
    /// A filter whose estimate exceeds this multiple of the running result
    /// is evaluated against the candidates' identities instead
    pub metric_name_match_ratio: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tsid_cache_capacity: 1 << 20,
            metric_name_cache_capacity: 1 << 18,
            max_days_for_per_day_index: 40,
            id_block_size: 1 << 16,
            strict_registration: false,
            registration_lock_stripes: 64,
            regex_match_cache_size: 10_000,
            estimate_scan_cap: 100_000,
            estimate_cache_capacity: 1 << 16,
            metric_name_match_ratio: 20,
        }
    }
}
