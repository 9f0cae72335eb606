//! Index table - ordered key-value rows backed by a WAL and snapshots
//!
//! Layout of the data directory:
//! - `wal/wal_NNNNNNNN.log`: batches committed since the last checkpoint
//! - `snapshot.bin`: all rows as of the last checkpoint
//!
//! Write path: WAL -> in-memory BTreeMap. Read path: BTreeMap only.
//! A checkpoint rotates the WAL, writes a snapshot of the rows and drops the
//! WAL files the snapshot covers.

use crate::batch::WriteBatch;
use crate::error::{Result, StorageError};
use crate::store::KvStore;
use crate::wal::{WalDurability, WalReader, WalWriter};
use crc32fast::Hasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_MAGIC: &[u8; 8] = b"IXSNAP01";
/// magic + start file number + next sequence + row count + checksum
const SNAPSHOT_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 4;

/// Index table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexTableConfig {
    /// Data directory. `None` keeps the table purely in memory.
    pub data_dir: Option<PathBuf>,
    /// WAL durability mode
    pub wal_durability: WalDurability,
    /// Maximum size of one WAL file before rotation (bytes)
    pub max_wal_file_size: u64,
}

impl Default for IndexTableConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            wal_durability: WalDurability::default(),
            max_wal_file_size: 64 * 1024 * 1024,
        }
    }
}

impl IndexTableConfig {
    /// Persistent table rooted at `dir`
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }
}

/// Index table statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    /// Rows currently stored
    pub row_count: usize,
    /// Batches committed since open
    pub batches_written: u64,
    /// Rows committed since open
    pub rows_written: u64,
    /// Batches replayed from the WAL at open
    pub batches_replayed: u64,
    /// Current WAL file number
    pub wal_file_num: u64,
}

/// Ordered key-value table implementing [`KvStore`]
pub struct IndexTable {
    config: IndexTableConfig,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Option<WalWriter>,
    closed: AtomicBool,
    batches_written: AtomicU64,
    rows_written: AtomicU64,
    batches_replayed: u64,
}

impl IndexTable {
    /// Open a table, restoring the last snapshot and replaying the WAL
    pub fn open(config: IndexTableConfig) -> Result<Self> {
        let dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => return Ok(Self::with_rows(config, BTreeMap::new(), None, 0)),
        };
        std::fs::create_dir_all(&dir)?;

        let (mut rows, start_file_num, mut next_sequence) =
            match read_snapshot(&dir.join(SNAPSHOT_FILE))? {
                Some(snapshot) => snapshot,
                None => (BTreeMap::new(), 0, 0),
            };

        let wal_dir = dir.join("wal");
        let entries = WalReader::new(&wal_dir).read_all_from(start_file_num)?;
        let replayed = entries.len() as u64;
        for entry in entries {
            next_sequence = next_sequence.max(entry.sequence + 1);
            for (key, value) in entry.batch.into_entries() {
                rows.insert(key, value);
            }
        }

        if replayed > 0 {
            info!(
                "Replayed {} WAL batches, table has {} rows",
                replayed,
                rows.len()
            );
        }

        let wal = WalWriter::new(
            &wal_dir,
            config.wal_durability,
            start_file_num,
            next_sequence,
        )?
        .with_max_file_size(config.max_wal_file_size);

        Ok(Self::with_rows(config, rows, Some(wal), replayed))
    }

    /// Create a table that lives only in memory
    pub fn in_memory() -> Self {
        Self::with_rows(IndexTableConfig::default(), BTreeMap::new(), None, 0)
    }

    fn with_rows(
        config: IndexTableConfig,
        rows: BTreeMap<Vec<u8>, Vec<u8>>,
        wal: Option<WalWriter>,
        batches_replayed: u64,
    ) -> Self {
        Self {
            config,
            rows: RwLock::new(rows),
            wal,
            closed: AtomicBool::new(false),
            batches_written: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            batches_replayed,
        }
    }

    /// Get the table configuration
    pub fn config(&self) -> &IndexTableConfig {
        &self.config
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Check if the table holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Table statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            row_count: self.len(),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_replayed: self.batches_replayed,
            wal_file_num: self.wal.as_ref().map(|w| w.file_num()).unwrap_or(0),
        }
    }

    /// Persist all rows to a snapshot and drop the WAL files it covers.
    ///
    /// No-op for in-memory tables.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        let (wal, dir) = match (&self.wal, &self.config.data_dir) {
            (Some(wal), Some(dir)) => (wal, dir),
            _ => return Ok(()),
        };

        // Writers hold the write lock across WAL append and apply, so a read
        // lock here pins a state matching exactly the closed WAL files.
        let (rows, start_file_num, next_sequence) = {
            let rows = self.rows.read();
            let start_file_num = wal.rotate()?;
            (rows.clone(), start_file_num, wal.sequence())
        };

        write_snapshot(dir, &rows, start_file_num, next_sequence)?;
        let removed = wal.remove_files_before(start_file_num)?;
        info!(
            "Checkpointed {} rows, removed {} WAL files",
            rows.len(),
            removed
        );
        Ok(())
    }

    /// Flush and reject further writes
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        debug!("Index table closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl KvStore for IndexTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.rows.read().get(key).cloned())
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.rows.read().contains_key(key))
    }

    fn scan_from(
        &self,
        prefix: &[u8],
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let start = if start.starts_with(prefix) { start } else { prefix };
        let rows = self.rows.read();
        for (key, value) in rows.range::<[u8], _>((Bound::Included(start), Bound::Unbounded)) {
            if !key.starts_with(prefix) || !visit(key.as_slice(), value.as_slice()) {
                break;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let row_count = batch.len() as u64;
        let mut rows = self.rows.write();
        if let Some(wal) = &self.wal {
            wal.write(&batch)?;
        }
        for (key, value) in batch.into_entries() {
            rows.insert(key, value);
        }
        drop(rows);

        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(row_count, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }
}

impl Drop for IndexTable {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close index table: {}", e);
        }
    }
}

type SnapshotState = (BTreeMap<Vec<u8>, Vec<u8>>, u64, u64);

fn write_snapshot(
    dir: &Path,
    rows: &BTreeMap<Vec<u8>, Vec<u8>>,
    start_file_num: u64,
    next_sequence: u64,
) -> Result<()> {
    let payload = bincode::serialize(rows)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);

    let mut header = Vec::with_capacity(SNAPSHOT_HEADER_SIZE);
    header.extend_from_slice(SNAPSHOT_MAGIC);
    header.extend_from_slice(&start_file_num.to_le_bytes());
    header.extend_from_slice(&next_sequence.to_le_bytes());
    header.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    header.extend_from_slice(&hasher.finalize().to_le_bytes());

    let tmp_path = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&header)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, dir.join(SNAPSHOT_FILE))?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<SnapshotState>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < SNAPSHOT_HEADER_SIZE || &bytes[0..8] != SNAPSHOT_MAGIC {
        return Err(StorageError::SnapshotCorrupted(format!(
            "{} has an invalid header",
            path.display()
        )));
    }

    let u64_at = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[i..i + 8]);
        u64::from_le_bytes(b)
    };
    let start_file_num = u64_at(8);
    let next_sequence = u64_at(16);
    let row_count = u64_at(24);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[32..36]);
    let expected = u32::from_le_bytes(crc);

    let payload = &bytes[SNAPSHOT_HEADER_SIZE..];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let computed = hasher.finalize();
    if computed != expected {
        return Err(StorageError::SnapshotCorrupted(format!(
            "checksum mismatch: expected {:x}, got {:x}",
            expected, computed
        )));
    }

    let rows: BTreeMap<Vec<u8>, Vec<u8>> = bincode::deserialize(payload)?;
    if rows.len() as u64 != row_count {
        return Err(StorageError::SnapshotCorrupted(format!(
            "expected {} rows, found {}",
            row_count,
            rows.len()
        )));
    }

    debug!("Loaded snapshot with {} rows", rows.len());
    Ok(Some((rows, start_file_num, next_sequence)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(table: &IndexTable, key: &str, value: &str) {
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), value.as_bytes());
        table.write_batch(batch).unwrap();
    }

    fn collect_prefix(table: &IndexTable, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        table
            .scan_prefix(prefix, &mut |k, _| {
                keys.push(k.to_vec());
                true
            })
            .unwrap();
        keys
    }

    fn persistent(dir: &TempDir) -> IndexTableConfig {
        IndexTableConfig {
            wal_durability: WalDurability::EveryWrite,
            ..IndexTableConfig::persistent(dir.path())
        }
    }

    #[test]
    fn test_in_memory_get_and_scan() {
        let table = IndexTable::in_memory();
        put(&table, "a/2", "x");
        put(&table, "a/1", "y");
        put(&table, "b/1", "z");

        assert_eq!(table.get(b"a/1").unwrap(), Some(b"y".to_vec()));
        assert_eq!(table.get(b"c").unwrap(), None);
        assert!(table.contains(b"b/1").unwrap());
        assert_eq!(
            collect_prefix(&table, b"a/"),
            vec![b"a/1".to_vec(), b"a/2".to_vec()]
        );
    }

    #[test]
    fn test_scan_from_and_early_stop() {
        let table = IndexTable::in_memory();
        for k in ["p/a", "p/b", "p/c", "q/a"] {
            put(&table, k, "");
        }

        let mut seen = Vec::new();
        table
            .scan_from(b"p/", b"p/b", &mut |k, _| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"p/b".to_vec(), b"p/c".to_vec()]);

        let mut count = 0;
        table
            .scan_prefix(b"p/", &mut |_, _| {
                count += 1;
                false
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reopen_replays_wal() {
        let dir = TempDir::new().unwrap();
        {
            let table = IndexTable::open(persistent(&dir)).unwrap();
            put(&table, "k1", "v1");
            put(&table, "k2", "v2");
        }

        let table = IndexTable::open(persistent(&dir)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(table.stats().batches_replayed, 2);
    }

    #[test]
    fn test_checkpoint_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let table = IndexTable::open(persistent(&dir)).unwrap();
            put(&table, "k1", "v1");
            table.checkpoint().unwrap();
            put(&table, "k2", "v2");
        }

        let table = IndexTable::open(persistent(&dir)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.stats().batches_replayed, 1);
        assert_eq!(table.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        // Sequence numbering keeps increasing across checkpoints
        put(&table, "k3", "v3");
        drop(table);
        let table = IndexTable::open(persistent(&dir)).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_corrupted_snapshot_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let table = IndexTable::open(persistent(&dir)).unwrap();
            put(&table, "k1", "v1");
            table.checkpoint().unwrap();
        }

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            IndexTable::open(persistent(&dir)),
            Err(StorageError::SnapshotCorrupted(_))
        ));
    }

    #[test]
    fn test_closed_table_rejects_operations() {
        let table = IndexTable::in_memory();
        put(&table, "k", "v");
        table.close().unwrap();
        assert!(matches!(table.get(b"k"), Err(StorageError::Closed)));
        assert!(matches!(
            table.write_batch(WriteBatch::new()),
            Err(StorageError::Closed)
        ));
    }
}
