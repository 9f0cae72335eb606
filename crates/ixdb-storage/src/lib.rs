//! Storage for the ixdb series index
//!
//! Provides the ordered key-value boundary the index is written against
//! ([`KvStore`]) and a durable implementation of it ([`IndexTable`]): rows
//! live in an in-memory ordered map, every batch is logged to a WAL first,
//! and checkpoints fold the WAL into a snapshot.

pub mod batch;
pub mod error;
pub mod store;
pub mod table;
pub mod wal;

pub use batch::WriteBatch;
pub use error::{Result, StorageError};
pub use store::KvStore;
pub use table::{IndexTable, IndexTableConfig, TableStats};
pub use wal::{WalDurability, WalEntry, WalReader, WalWriter};
