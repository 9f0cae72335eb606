//! Write-Ahead Log implementation
//!
//! Every committed batch is appended to the WAL before it becomes visible in
//! the table, so a reopened table replays exactly the batches that were
//! acknowledged. Supports multiple durability modes for different
//! performance/safety tradeoffs.

mod reader;
mod writer;

pub use reader::{WalEntry, WalReader};
pub use writer::{WalDurability, WalWriter};

/// File name of the WAL segment with the given number
pub(crate) fn wal_file_name(file_num: u64) -> String {
    format!("wal_{:08}.log", file_num)
}

/// Parse the segment number out of a WAL file name
pub(crate) fn parse_wal_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}
