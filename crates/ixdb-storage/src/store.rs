//! Key-value store boundary used by the index
//!
//! The index only needs ordered prefix scans, point reads, atomic batched
//! writes and a flush. Anything providing those can back it.

use crate::batch::WriteBatch;
use crate::error::Result;

/// Ordered key-value store.
///
/// Implementations must apply a [`WriteBatch`] atomically with respect to
/// `get` and the scans, and each scan must observe a consistent state.
pub trait KvStore: Send + Sync {
    /// Point lookup
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Check whether a key is present
    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Visit rows whose key starts with `prefix`, in key order, starting at
    /// the first key `>= start`. `start` must itself start with `prefix`.
    /// The visitor returns `false` to stop the scan early.
    fn scan_from(
        &self,
        prefix: &[u8],
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()>;

    /// Visit all rows whose key starts with `prefix`, in key order
    fn scan_prefix(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.scan_from(prefix, prefix, visit)
    }

    /// Commit a batch atomically
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Make every committed batch durable and visible to new scans
    fn flush(&self) -> Result<()>;
}
