//! Write batches
//!
//! A batch is the unit of atomicity of the table: it is logged as one WAL
//! entry and applied under one write lock, so readers observe all of its rows
//! or none of them.

use serde::{Deserialize, Serialize};

/// Ordered list of puts committed atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty batch with room for `capacity` rows
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Stage a put. Later puts of the same key win.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Number of staged rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate payload size in bytes
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Iterate staged rows in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Consume the batch, returning its rows in insertion order
    pub fn into_entries(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_put_and_iter() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(&b"b"[..], &b"22"[..]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.byte_size(), 5);

        let rows: Vec<_> = batch.iter().collect();
        assert_eq!(rows[0], (&b"a"[..], &b"1"[..]));
        assert_eq!(rows[1], (&b"b"[..], &b"22"[..]));
    }
}
