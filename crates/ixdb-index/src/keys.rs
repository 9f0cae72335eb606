//! Row key layout
//!
//! Every row key starts with a one-byte namespace. Inside a namespace, keys
//! are built so that the prefix scans the search needs are contiguous:
//!
//! | namespace     | key                                           | value    |
//! |---------------|-----------------------------------------------|----------|
//! | `NS_NAME`     | encoded identity                              | TSID     |
//! | `NS_TAG`      | scope, tag key, tag value, metric id          | empty    |
//! | `NS_ID_TSID`  | scope, metric id                              | TSID     |
//! | `NS_ID_NAME`  | scope, metric id                              | identity |
//! | `NS_DATE`     | scope, date, metric id                        | empty    |
//! | `NS_DATE_TAG` | scope, date, tag key, tag value, metric id    | empty    |
//! | `NS_NEXT_ID`  | -                                             | u64      |
//!
//! Tag keys and values are escaped and terminated, integers are big-endian.
//! The metric group is stored as the tag with the empty key.

use crate::error::{IndexError, Result};
use ixdb_core::encoding::{marshal_escaped, marshal_tag_value, read_u64_be, unmarshal_tag_value};
use ixdb_core::{MetricId, Scope};

pub const NS_NAME: u8 = 0;
pub const NS_TAG: u8 = 1;
pub const NS_ID_TSID: u8 = 2;
pub const NS_ID_NAME: u8 = 3;
pub const NS_DATE: u8 = 4;
pub const NS_DATE_TAG: u8 = 5;
pub const NS_NEXT_ID: u8 = 6;

const METRIC_ID_SIZE: usize = 8;

fn scoped(ns: u8, scope: Scope) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + Scope::SIZE + 32);
    key.push(ns);
    scope.marshal(&mut key);
    key
}

/// Forward row: encoded identity -> TSID
pub fn name_key(encoded: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + encoded.len());
    key.push(NS_NAME);
    key.extend_from_slice(encoded);
    key
}

/// Scope-universe row: metric id -> TSID
pub fn id_tsid_key(scope: Scope, id: MetricId) -> Vec<u8> {
    let mut key = scoped(NS_ID_TSID, scope);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Reverse row: metric id -> encoded identity
pub fn id_name_key(scope: Scope, id: MetricId) -> Vec<u8> {
    let mut key = scoped(NS_ID_NAME, scope);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Allocator high-water mark row
pub fn next_id_key() -> Vec<u8> {
    vec![NS_NEXT_ID]
}

/// Where postings and the universe of a search come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostingsSource {
    /// All series ever registered
    Global,
    /// Series with samples on one day
    Date(u64),
}

impl PostingsSource {
    /// Prefix of all universe rows of `scope`
    pub fn universe_prefix(&self, scope: Scope) -> Vec<u8> {
        match *self {
            PostingsSource::Global => scoped(NS_ID_TSID, scope),
            PostingsSource::Date(date) => {
                let mut key = scoped(NS_DATE, scope);
                key.extend_from_slice(&date.to_be_bytes());
                key
            }
        }
    }

    /// Universe row of one metric id
    pub fn universe_key(&self, scope: Scope, id: MetricId) -> Vec<u8> {
        let mut key = self.universe_prefix(scope);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// Prefix of all tag rows of `scope`
    pub fn tag_prefix(&self, scope: Scope) -> Vec<u8> {
        match *self {
            PostingsSource::Global => scoped(NS_TAG, scope),
            PostingsSource::Date(date) => {
                let mut key = scoped(NS_DATE_TAG, scope);
                key.extend_from_slice(&date.to_be_bytes());
                key
            }
        }
    }

    /// Prefix of all rows of one tag key
    pub fn tag_key_prefix(&self, scope: Scope, tag_key: &[u8]) -> Vec<u8> {
        let mut key = self.tag_prefix(scope);
        marshal_tag_value(&mut key, tag_key);
        key
    }

    /// Prefix of rows whose value of `tag_key` starts with `value_prefix`
    pub fn tag_value_prefix_hint(&self, scope: Scope, tag_key: &[u8], value_prefix: &[u8]) -> Vec<u8> {
        let mut key = self.tag_key_prefix(scope, tag_key);
        marshal_escaped(&mut key, value_prefix);
        key
    }

    /// Prefix of the postings of one tag
    pub fn tag_value_prefix(&self, scope: Scope, tag_key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut key = self.tag_key_prefix(scope, tag_key);
        marshal_tag_value(&mut key, value);
        key
    }

    /// Row linking one tag to one metric id
    pub fn tag_row_key(&self, scope: Scope, tag_key: &[u8], value: &[u8], id: MetricId) -> Vec<u8> {
        let mut key = self.tag_value_prefix(scope, tag_key, value);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }
}

/// Metric id stored in the last eight bytes of a row key
pub fn parse_metric_id_suffix(key: &[u8]) -> Result<MetricId> {
    if key.len() < METRIC_ID_SIZE {
        return Err(IndexError::StoreUnavailable(format!(
            "index row key too short: {} bytes",
            key.len()
        )));
    }
    let (id, _) = read_u64_be(&key[key.len() - METRIC_ID_SIZE..])?;
    Ok(id)
}

/// Split `escaped(value) 0 metric_id` into the raw value and the id
pub fn parse_tag_value_row(value_buf: &mut Vec<u8>, rest: &[u8]) -> Result<MetricId> {
    value_buf.clear();
    let tail = unmarshal_tag_value(value_buf, rest)?;
    if tail.len() != METRIC_ID_SIZE {
        return Err(IndexError::StoreUnavailable(format!(
            "malformed tag row: {} trailing bytes",
            tail.len()
        )));
    }
    let (id, _) = read_u64_be(tail)?;
    Ok(id)
}

/// Decode the tag key at the front of `rest`
pub fn parse_tag_key(rest: &[u8]) -> Result<Vec<u8>> {
    let mut tag_key = Vec::new();
    unmarshal_tag_value(&mut tag_key, rest)?;
    Ok(tag_key)
}

/// Decode the tag value at the front of `rest`
pub fn parse_tag_value(rest: &[u8]) -> Result<Vec<u8>> {
    let mut value = Vec::new();
    unmarshal_tag_value(&mut value, rest)?;
    Ok(value)
}

/// Smallest key greater than every key starting with `prefix` followed by a
/// terminator, used to skip to the next distinct escaped string
pub fn skip_past_terminated(prefix: &[u8], escaped: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + escaped.len() + 1);
    key.extend_from_slice(prefix);
    key.extend_from_slice(escaped);
    key.push(1);
    key
}
