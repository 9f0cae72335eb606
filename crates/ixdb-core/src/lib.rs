//! ixdb Core - Series identity types for the ixdb index
//!
//! This crate provides the fundamental data types shared by the index and storage crates:
//! - `Scope`: the (account, project) namespace every series lives in
//! - `Tag`: key-value pair of opaque bytes
//! - `MetricName`: canonical series identity and its byte codec
//! - `MetricId`: compact numeric series identifier
//! - `Tsid`: sortable fixed-size series descriptor
//! - `TimeRange`: millisecond time range with day/hour helpers

pub mod encoding;
pub mod error;
pub mod types;

pub use error::{CoreError, Result};
pub use types::*;
