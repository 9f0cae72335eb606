//! WAL writer implementation
//!
//! Optimizations:
//! - Serialization and checksumming happen outside the file lock
//! - Buffered writes with a large BufWriter
//! - Periodic fsync instead of per-batch fsync by default

use super::{parse_wal_file_name, wal_file_name};
use crate::batch::WriteBatch;
use crate::error::Result;
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// WAL durability modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalDurability {
    /// fsync after every write (strongest durability, slowest)
    EveryWrite,
    /// fsync when at least `interval_ms` passed since the previous fsync
    Periodic { interval_ms: u64 },
    /// Hand data to the OS after every write, never fsync
    OsDefault,
    /// Same as OsDefault; accepts data loss on power failure
    None,
}

impl Default for WalDurability {
    fn default() -> Self {
        WalDurability::Periodic { interval_ms: 100 }
    }
}

/// WAL entry header
#[derive(Debug, Clone)]
pub(crate) struct WalEntryHeader {
    /// Entry sequence number
    pub(crate) sequence: u64,
    /// Wall-clock time of the write (nanoseconds)
    pub(crate) timestamp: i64,
    /// Number of rows in the batch
    pub(crate) row_count: u32,
    /// Length of the serialized batch
    pub(crate) data_len: u32,
    /// CRC32 of the header fields above and the data
    pub(crate) checksum: u32,
}

impl WalEntryHeader {
    pub(crate) const SIZE: usize = 32; // 8 + 8 + 4 + 4 + 4 + 4 (padding)

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.row_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.data_len.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes[28..32] is padding
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            b
        };
        let u32_at = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i..i + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            sequence: u64::from_le_bytes(u64_at(0)),
            timestamp: i64::from_le_bytes(u64_at(8)),
            row_count: u32_at(16),
            data_len: u32_at(20),
            checksum: u32_at(24),
        }
    }

    /// Checksum over the header fields and the payload
    pub(crate) fn compute_checksum(
        sequence: u64,
        timestamp: i64,
        row_count: u32,
        data: &[u8],
    ) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&sequence.to_le_bytes());
        hasher.update(&timestamp.to_le_bytes());
        hasher.update(&row_count.to_le_bytes());
        hasher.update(&(data.len() as u32).to_le_bytes());
        hasher.update(data);
        hasher.finalize()
    }
}

/// Default BufWriter capacity (256KB for better batching)
const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024;

/// Default maximum size of one WAL file
const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// WAL writer
pub struct WalWriter {
    /// Path to the WAL directory
    dir: PathBuf,
    /// Current WAL file
    file: Mutex<BufWriter<File>>,
    /// Next sequence number
    sequence: AtomicU64,
    /// Durability mode
    durability: WalDurability,
    /// Last sync time
    last_sync: Mutex<Instant>,
    /// Current WAL file number
    file_num: AtomicU64,
    /// Maximum WAL file size (bytes)
    max_file_size: u64,
    /// Current file size
    current_size: AtomicU64,
}

impl WalWriter {
    /// Open a WAL writer appending to the newest file in `dir`.
    ///
    /// `min_file_num` forces a fresh file when every existing file is older
    /// than a checkpoint; `next_sequence` continues numbering after replay.
    pub fn new(
        dir: impl AsRef<Path>,
        durability: WalDurability,
        min_file_num: u64,
        next_sequence: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let file_num = Self::find_last_file_num(&dir)?.max(min_file_num);
        let file = Self::open_file(&dir, file_num)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            dir,
            file: Mutex::new(BufWriter::with_capacity(DEFAULT_BUFFER_CAPACITY, file)),
            sequence: AtomicU64::new(next_sequence),
            durability,
            last_sync: Mutex::new(Instant::now()),
            file_num: AtomicU64::new(file_num),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            current_size: AtomicU64::new(current_size),
        })
    }

    /// Create with custom max file size
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size.max(WalEntryHeader::SIZE as u64);
        self
    }

    /// Append a batch to the WAL, returning its sequence number
    pub fn write(&self, batch: &WriteBatch) -> Result<u64> {
        // Serialize outside the lock to reduce contention
        let data = bincode::serialize(batch)?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let row_count = batch.len() as u32;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let checksum = WalEntryHeader::compute_checksum(sequence, timestamp, row_count, &data);
        let header = WalEntryHeader {
            sequence,
            timestamp,
            row_count,
            data_len: data.len() as u32,
            checksum,
        };
        let entry_size = (WalEntryHeader::SIZE + data.len()) as u64;

        {
            let mut file = self.file.lock();
            file.write_all(&header.to_bytes())?;
            file.write_all(&data)?;
        }

        // Appended entries are replayed on open, so later failures only log.
        // Rotation is retried on the next write.
        let new_size = self.current_size.fetch_add(entry_size, Ordering::Relaxed) + entry_size;
        if new_size >= self.max_file_size {
            if let Err(e) = self.rotate() {
                warn!("WAL rotation after entry {} failed: {}", sequence, e);
            }
        }

        if let Err(e) = self.maybe_sync() {
            warn!("WAL sync after entry {} failed: {}", sequence, e);
        }
        Ok(sequence)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.get_ref().sync_all()?;
        *self.last_sync.lock() = Instant::now();
        Ok(())
    }

    /// Next sequence number to be assigned
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Current WAL file number
    pub fn file_num(&self) -> u64 {
        self.file_num.load(Ordering::SeqCst)
    }

    /// Get the WAL directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Switch to a new WAL file, returning its number
    pub fn rotate(&self) -> Result<u64> {
        let mut file = self.file.lock();
        let new_file_num = self.file_num.load(Ordering::SeqCst) + 1;
        let new_file = Self::open_file(&self.dir, new_file_num)?;

        file.flush()?;
        file.get_ref().sync_all()?;
        *file = BufWriter::with_capacity(DEFAULT_BUFFER_CAPACITY, new_file);

        self.file_num.store(new_file_num, Ordering::SeqCst);
        self.current_size.store(0, Ordering::SeqCst);
        debug!("Rotated WAL to file {}", new_file_num);
        Ok(new_file_num)
    }

    /// Delete WAL files numbered below `file_num`
    pub fn remove_files_before(&self, file_num: u64) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(num) = parse_wal_file_name(&name.to_string_lossy()) {
                if num < file_num {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn maybe_sync(&self) -> Result<()> {
        match self.durability {
            WalDurability::EveryWrite => {
                self.sync()?;
            }
            WalDurability::Periodic { interval_ms } => {
                let last_sync = *self.last_sync.lock();
                if last_sync.elapsed() >= Duration::from_millis(interval_ms) {
                    self.sync()?;
                } else {
                    self.file.lock().flush()?;
                }
            }
            WalDurability::OsDefault | WalDurability::None => {
                // Flush buffer to OS (but no fsync)
                self.file.lock().flush()?;
            }
        }
        Ok(())
    }

    fn open_file(dir: &Path, file_num: u64) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(wal_file_name(file_num)))?)
    }

    fn find_last_file_num(dir: &Path) -> Result<u64> {
        let mut max_num = 0u64;

        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(num) = parse_wal_file_name(&entry.file_name().to_string_lossy()) {
                    max_num = max_num.max(num);
                }
            }
        }

        Ok(max_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch_of(i: u32) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(format!("key-{}", i).into_bytes(), i.to_be_bytes().to_vec());
        batch
    }

    #[test]
    fn test_wal_writer_sequences() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::new(dir.path(), WalDurability::EveryWrite, 0, 10).unwrap();

        assert_eq!(writer.write(&batch_of(1)).unwrap(), 10);
        assert_eq!(writer.write(&batch_of(2)).unwrap(), 11);
        assert_eq!(writer.sequence(), 12);
    }

    #[test]
    fn test_wal_writer_rotation() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::new(dir.path(), WalDurability::None, 0, 0)
            .unwrap()
            .with_max_file_size(64);

        for i in 0..10 {
            writer.write(&batch_of(i)).unwrap();
        }
        assert!(writer.file_num() >= 5);

        let before = writer.file_num();
        let removed = writer.remove_files_before(before).unwrap();
        assert_eq!(removed as u64, before);
    }

    #[test]
    fn test_failed_rotation_keeps_entry_written() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let writer = WalWriter::new(&wal_dir, WalDurability::EveryWrite, 0, 0)
            .unwrap()
            .with_max_file_size(1);
        let first_file = writer.file_num();

        std::fs::remove_dir_all(&wal_dir).unwrap();
        assert_eq!(writer.write(&batch_of(1)).unwrap(), 0);
        assert_eq!(writer.file_num(), first_file);
        assert_eq!(writer.sequence(), 1);

        std::fs::create_dir_all(&wal_dir).unwrap();
        assert_eq!(writer.write(&batch_of(2)).unwrap(), 1);
        assert_eq!(writer.file_num(), first_file + 1);
    }

    #[test]
    fn test_wal_writer_respects_min_file_num() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::new(dir.path(), WalDurability::None, 7, 0).unwrap();
        assert_eq!(writer.file_num(), 7);
        assert!(dir.path().join(wal_file_name(7)).exists());
    }
}
