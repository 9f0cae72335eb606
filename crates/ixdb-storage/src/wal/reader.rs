//! WAL reader implementation

use super::parse_wal_file_name;
use super::writer::WalEntryHeader;
use crate::batch::WriteBatch;
use crate::error::{Result, StorageError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// WAL entry
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Entry sequence number
    pub sequence: u64,
    /// Timestamp when entry was written
    pub timestamp: i64,
    /// Rows committed by this entry
    pub batch: WriteBatch,
}

/// WAL reader for recovery
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Read all entries from all WAL files
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        self.read_all_from(0)
    }

    /// Read entries from files numbered `min_file_num` and above, in
    /// sequence order
    pub fn read_all_from(&self, min_file_num: u64) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();

        for (num, path) in self.list_wal_files()? {
            if num < min_file_num {
                continue;
            }
            entries.extend(self.read_file(&path)?);
        }

        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Read a single WAL file.
    ///
    /// A partially written trailing entry is dropped with a warning; a
    /// checksum mismatch on a complete entry is an error.
    pub fn read_file(&self, path: &Path) -> Result<Vec<WalEntry>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let mut header_bytes = [0u8; WalEntryHeader::SIZE];
            match read_full(&mut reader, &mut header_bytes)? {
                0 => break,
                n if n < WalEntryHeader::SIZE => {
                    warn!("Truncated WAL header in {}", path.display());
                    break;
                }
                _ => {}
            }

            let header = WalEntryHeader::from_bytes(&header_bytes);

            let mut data = vec![0u8; header.data_len as usize];
            if read_full(&mut reader, &mut data)? < data.len() {
                warn!(
                    "Truncated WAL entry at sequence {} in {}",
                    header.sequence,
                    path.display()
                );
                break;
            }

            let computed = WalEntryHeader::compute_checksum(
                header.sequence,
                header.timestamp,
                header.row_count,
                &data,
            );
            if computed != header.checksum {
                return Err(StorageError::WalCorrupted(format!(
                    "Checksum mismatch at sequence {}: expected {:x}, got {:x}",
                    header.sequence, header.checksum, computed
                )));
            }

            let batch: WriteBatch = bincode::deserialize(&data)?;
            if batch.len() != header.row_count as usize {
                return Err(StorageError::WalCorrupted(format!(
                    "Row count mismatch at sequence {}",
                    header.sequence
                )));
            }

            entries.push(WalEntry {
                sequence: header.sequence,
                timestamp: header.timestamp,
                batch,
            });
        }

        Ok(entries)
    }

    /// List all WAL files ordered by file number
    pub fn list_wal_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let num = parse_wal_file_name(&e.file_name().to_string_lossy())?;
                Some((num, e.path()))
            })
            .collect();

        files.sort_by_key(|(num, _)| *num);
        Ok(files)
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{wal_file_name, WalDurability, WalWriter};
    use std::io::Write;
    use tempfile::TempDir;

    fn batch_of(key: &str, value: &str) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), value.as_bytes());
        batch
    }

    #[test]
    fn test_wal_write_read() {
        let dir = TempDir::new().unwrap();

        {
            let writer = WalWriter::new(dir.path(), WalDurability::EveryWrite, 0, 0).unwrap();
            writer.write(&batch_of("a", "1")).unwrap();
            writer.write(&batch_of("b", "2")).unwrap();
        }

        let reader = WalReader::new(dir.path());
        let entries = reader.read_all().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 0);
        assert_eq!(entries[1].sequence, 1);
        let rows: Vec<_> = entries[1].batch.iter().collect();
        assert_eq!(rows, vec![(&b"b"[..], &b"2"[..])]);
    }

    #[test]
    fn test_wal_read_from_file_number() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::new(dir.path(), WalDurability::None, 0, 0).unwrap();
        writer.write(&batch_of("old", "1")).unwrap();
        let next = writer.rotate().unwrap();
        writer.write(&batch_of("new", "2")).unwrap();
        drop(writer);

        let entries = WalReader::new(dir.path()).read_all_from(next).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
    }

    #[test]
    fn test_wal_truncated_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::new(dir.path(), WalDurability::EveryWrite, 0, 0).unwrap();
            writer.write(&batch_of("a", "1")).unwrap();
            writer.write(&batch_of("b", "2")).unwrap();
        }

        let path = dir.path().join(wal_file_name(0));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let entries = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_wal_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::new(dir.path(), WalDurability::EveryWrite, 0, 0).unwrap();
            writer.write(&batch_of("a", "1")).unwrap();
        }

        let path = dir.path().join(wal_file_name(0));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let err = WalReader::new(dir.path()).read_all().unwrap_err();
        assert!(matches!(err, StorageError::WalCorrupted(_)));
    }
}
