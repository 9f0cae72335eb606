//! Core data types for the ixdb series index

use crate::encoding::{marshal_tag_value, read_u32_be, read_u64_be, unmarshal_tag_value};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Millisecond-precision Unix epoch timestamp
pub type Timestamp = i64;

/// Compact numeric identifier of a series, allocated by the registrar
pub type MetricId = u64;

/// Milliseconds in one hour
pub const MSECS_PER_HOUR: i64 = 60 * 60 * 1000;

/// Milliseconds in one day
pub const MSECS_PER_DAY: i64 = 24 * MSECS_PER_HOUR;

/// Tag key that addresses the metric group in filters
pub const METRIC_GROUP_TAG_KEY: &[u8] = b"__name__";

/// Day number (days since the Unix epoch) of a timestamp.
/// Timestamps before the epoch map to day 0.
pub fn date_from_timestamp(ts: Timestamp) -> u64 {
    (ts.max(0) / MSECS_PER_DAY) as u64
}

/// Hour number (hours since the Unix epoch) of a timestamp
pub fn hour_from_timestamp(ts: Timestamp) -> u64 {
    (ts.max(0) / MSECS_PER_HOUR) as u64
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// The (account, project) namespace that partitions identifiers and index rows
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Scope {
    pub account_id: u32,
    pub project_id: u32,
}

impl Scope {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Create a new scope
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }

    /// Append the big-endian encoding of this scope
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.account_id.to_be_bytes());
        dst.extend_from_slice(&self.project_id.to_be_bytes());
    }

    /// Decode a scope from the front of `src`
    pub fn unmarshal(src: &[u8]) -> Result<(Self, &[u8])> {
        let (account_id, tail) = read_u32_be(src)?;
        let (project_id, tail) = read_u32_be(tail)?;
        Ok((Self::new(account_id, project_id), tail))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.project_id)
    }
}

/// A tag is a key-value pair of opaque bytes identifying a series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    /// Create a new tag
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Validate the tag
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(CoreError::EmptyTagKey);
        }
        Ok(())
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.value.cmp(&other.value),
            other => other,
        }
    }
}

/// Canonical identity of a series: scope, metric group and tags sorted by key.
///
/// The marshaled form is the key of the forward index and of the identity
/// cache, so two names with the same scope, group and tag set always marshal
/// to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricName {
    /// Namespace of the series
    pub scope: Scope,
    /// Metric group (the metric name proper)
    pub metric_group: Vec<u8>,
    /// Tags, sorted by key with unique keys once `sort_tags` has run
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Create a metric name without tags
    pub fn new(scope: Scope, metric_group: impl Into<Vec<u8>>) -> Self {
        Self {
            scope,
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Add a tag; call `sort_tags` before marshaling
    pub fn add_tag(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.tags.push(Tag::new(key, value));
    }

    /// Builder-style `add_tag` that keeps tags sorted
    pub fn with_tag(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.add_tag(key, value);
        self.sort_tags();
        self
    }

    /// Sort tags by key. The sort is stable, so duplicate keys stay adjacent
    /// in insertion order and are reported by `validate`.
    pub fn sort_tags(&mut self) {
        self.tags.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Clear the name for reuse
    pub fn reset(&mut self) {
        self.scope = Scope::default();
        self.metric_group.clear();
        self.tags.clear();
    }

    /// Check that tag keys are non-empty, sorted and unique
    pub fn validate(&self) -> Result<()> {
        for tag in &self.tags {
            tag.validate()?;
        }
        for pair in self.tags.windows(2) {
            match pair[0].key.cmp(&pair[1].key) {
                Ordering::Less => {}
                Ordering::Equal => {
                    return Err(CoreError::DuplicateTagKey(
                        String::from_utf8_lossy(&pair[0].key).into_owned(),
                    ))
                }
                Ordering::Greater => return Err(CoreError::UnsortedTags),
            }
        }
        Ok(())
    }

    /// Marshal the canonical encoding
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut dst = Vec::with_capacity(self.encoded_len_hint());
        self.marshal_into(&mut dst)?;
        Ok(dst)
    }

    /// Append the canonical encoding to `dst`
    pub fn marshal_into(&self, dst: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        self.scope.marshal(dst);
        marshal_tag_value(dst, &self.metric_group);
        for tag in &self.tags {
            marshal_tag_value(dst, &tag.key);
            marshal_tag_value(dst, &tag.value);
        }
        Ok(())
    }

    /// Decode a canonical encoding produced by `marshal`
    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        let (scope, mut tail) = Scope::unmarshal(src)?;
        let mut metric_group = Vec::new();
        tail = unmarshal_tag_value(&mut metric_group, tail)?;

        let mut tags = Vec::new();
        while !tail.is_empty() {
            let mut key = Vec::new();
            tail = unmarshal_tag_value(&mut key, tail)?;
            let mut value = Vec::new();
            tail = unmarshal_tag_value(&mut value, tail)?;
            tags.push(Tag { key, value });
        }

        let mn = Self {
            scope,
            metric_group,
            tags,
        };
        mn.validate()?;
        Ok(mn)
    }

    /// Value of a tag; the empty key or `__name__` returns the metric group
    pub fn get_tag_value(&self, key: &[u8]) -> Option<&[u8]> {
        if key.is_empty() || key == METRIC_GROUP_TAG_KEY {
            return Some(&self.metric_group);
        }
        self.tags
            .binary_search_by(|t| t.key.as_slice().cmp(key))
            .ok()
            .map(|i| self.tags[i].value.as_slice())
    }

    fn encoded_len_hint(&self) -> usize {
        Scope::SIZE
            + self.metric_group.len()
            + 1
            + self
                .tags
                .iter()
                .map(|t| t.key.len() + t.value.len() + 2)
                .sum::<usize>()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", String::from_utf8_lossy(&self.metric_group))?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(
                f,
                "{}={:?}",
                String::from_utf8_lossy(&tag.key),
                String::from_utf8_lossy(&tag.value)
            )?;
        }
        write!(f, "}} @{}", self.scope)
    }
}

/// Encode an identity from unordered tags.
///
/// Tags are sorted by key first; duplicate or empty keys are rejected.
pub fn encode_identity(scope: Scope, metric_group: &[u8], tags: &[Tag]) -> Result<Vec<u8>> {
    let mut mn = MetricName {
        scope,
        metric_group: metric_group.to_vec(),
        tags: tags.to_vec(),
    };
    mn.sort_tags();
    mn.marshal()
}

/// Decode an identity produced by [`encode_identity`]
pub fn decode_identity(src: &[u8]) -> Result<MetricName> {
    MetricName::unmarshal(src)
}

/// Compact, sortable series descriptor.
///
/// Everything except `metric_id` is a deterministic function of the identity,
/// so series of one metric group (and job, instance) sort next to each other.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Tsid {
    pub account_id: u32,
    pub project_id: u32,
    /// Hash of the metric group
    pub metric_group_id: u64,
    /// Hash of the first tag value
    pub job_id: u32,
    /// Hash of the second tag value
    pub instance_id: u32,
    /// Registrar-allocated identifier
    pub metric_id: MetricId,
}

impl Tsid {
    /// Encoded size in bytes
    pub const SIZE: usize = 32;

    /// Derive the descriptor of a series with the given identifier
    pub fn from_metric_name(mn: &MetricName, metric_id: MetricId) -> Self {
        let tag_hash = |i: usize| -> u32 {
            mn.tags
                .get(i)
                .map(|t| fxhash::hash32(&t.value))
                .unwrap_or(0)
        };
        Self {
            account_id: mn.scope.account_id,
            project_id: mn.scope.project_id,
            metric_group_id: fxhash::hash64(&mn.metric_group),
            job_id: tag_hash(0),
            instance_id: tag_hash(1),
            metric_id,
        }
    }

    /// Scope of the series
    pub fn scope(&self) -> Scope {
        Scope::new(self.account_id, self.project_id)
    }

    /// Append the fixed-size big-endian encoding
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.account_id.to_be_bytes());
        dst.extend_from_slice(&self.project_id.to_be_bytes());
        dst.extend_from_slice(&self.metric_group_id.to_be_bytes());
        dst.extend_from_slice(&self.job_id.to_be_bytes());
        dst.extend_from_slice(&self.instance_id.to_be_bytes());
        dst.extend_from_slice(&self.metric_id.to_be_bytes());
    }

    /// Decode a descriptor produced by `marshal`
    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        if src.len() != Self::SIZE {
            return Err(CoreError::InvalidTsid(format!(
                "expected {} bytes, got {}",
                Self::SIZE,
                src.len()
            )));
        }
        let (account_id, tail) = read_u32_be(src)?;
        let (project_id, tail) = read_u32_be(tail)?;
        let (metric_group_id, tail) = read_u64_be(tail)?;
        let (job_id, tail) = read_u32_be(tail)?;
        let (instance_id, tail) = read_u32_be(tail)?;
        let (metric_id, _) = read_u64_be(tail)?;
        Ok(Self {
            account_id,
            project_id,
            metric_group_id,
            job_id,
            instance_id,
            metric_id,
        })
    }
}

/// Time range for searches, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering one whole day
    pub fn for_date(date: u64) -> Self {
        let start = date as i64 * MSECS_PER_DAY;
        Self::new(start, start + MSECS_PER_DAY)
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if the range contains no timestamps
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// First day touched by the range
    pub fn min_date(&self) -> u64 {
        date_from_timestamp(self.start)
    }

    /// Last day touched by the range
    pub fn max_date(&self) -> u64 {
        date_from_timestamp(self.end.saturating_sub(1))
    }

    /// Number of days touched by the range
    pub fn day_count(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.max_date() - self.min_date() + 1
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: 0,
            end: i64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_name() -> MetricName {
        let mut mn = MetricName::new(Scope::new(34327843, 893433), "http_requests_total");
        mn.add_tag("job", "api");
        mn.add_tag("instance", "10.0.0.1:9100");
        mn.add_tag("code", "200");
        mn.sort_tags();
        mn
    }

    #[test]
    fn test_tag_ordering() {
        let tag1 = Tag::new("a", "1");
        let tag2 = Tag::new("b", "1");
        let tag3 = Tag::new("a", "2");

        assert!(tag1 < tag2);
        assert!(tag1 < tag3);
        assert!(tag3 < tag2);
    }

    #[test]
    fn test_metric_name_roundtrip() {
        let mn = sample_name();
        let encoded = mn.marshal().unwrap();
        let decoded = MetricName::unmarshal(&encoded).unwrap();
        assert_eq!(decoded, mn);
        assert_eq!(decoded.tags[0].key, b"code");
    }

    #[test]
    fn test_roundtrip_with_binary_bytes() {
        let mut mn = MetricName::new(Scope::new(0, 0), vec![0u8, 1, 2, 255]);
        mn.add_tag(vec![1u8], vec![0u8, 0]);
        mn.add_tag("k", "");
        mn.sort_tags();

        let decoded = MetricName::unmarshal(&mn.marshal().unwrap()).unwrap();
        assert_eq!(decoded, mn);
    }

    #[test]
    fn test_encoding_ignores_input_order() {
        let scope = Scope::new(1, 2);
        let a = encode_identity(
            scope,
            b"cpu",
            &[Tag::new("host", "s1"), Tag::new("dc", "eu")],
        )
        .unwrap();
        let b = encode_identity(
            scope,
            b"cpu",
            &[Tag::new("dc", "eu"), Tag::new("host", "s1")],
        )
        .unwrap();
        assert_eq!(a, b);

        let other_scope = encode_identity(
            Scope::new(1, 3),
            b"cpu",
            &[Tag::new("dc", "eu"), Tag::new("host", "s1")],
        )
        .unwrap();
        assert_ne!(a, other_scope);
    }

    #[test]
    fn test_encoding_is_injective_on_boundaries() {
        let scope = Scope::default();
        // Moving bytes between group, key and value must change the encoding
        let a = encode_identity(scope, b"ab", &[Tag::new("c", "d")]).unwrap();
        let b = encode_identity(scope, b"a", &[Tag::new("bc", "d")]).unwrap();
        let c = encode_identity(scope, b"a", &[Tag::new("b", "cd")]).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_duplicate_and_empty_keys_rejected() {
        let scope = Scope::default();
        let dup = encode_identity(scope, b"m", &[Tag::new("k", "1"), Tag::new("k", "2")]);
        assert!(matches!(dup, Err(CoreError::DuplicateTagKey(k)) if k == "k"));

        let empty = encode_identity(scope, b"m", &[Tag::new("", "1")]);
        assert!(matches!(empty, Err(CoreError::EmptyTagKey)));
    }

    #[test]
    fn test_unsorted_marshal_rejected() {
        let mut mn = MetricName::new(Scope::default(), "m");
        mn.add_tag("z", "1");
        mn.add_tag("a", "1");
        assert!(matches!(mn.marshal(), Err(CoreError::UnsortedTags)));
        mn.sort_tags();
        assert!(mn.marshal().is_ok());
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        assert!(MetricName::unmarshal(&[1, 2, 3]).is_err());

        let mut encoded = sample_name().marshal().unwrap();
        encoded.pop();
        assert!(MetricName::unmarshal(&encoded).is_err());
    }

    #[test]
    fn test_get_tag_value() {
        let mn = sample_name();
        assert_eq!(mn.get_tag_value(b"job"), Some(&b"api"[..]));
        assert_eq!(mn.get_tag_value(b"missing"), None);
        assert_eq!(mn.get_tag_value(b""), Some(&b"http_requests_total"[..]));
        assert_eq!(
            mn.get_tag_value(METRIC_GROUP_TAG_KEY),
            Some(&b"http_requests_total"[..])
        );
    }

    #[test]
    fn test_tsid_deterministic_and_roundtrip() {
        let mn = sample_name();
        let a = Tsid::from_metric_name(&mn, 42);
        let b = Tsid::from_metric_name(&mn, 42);
        assert_eq!(a, b);
        assert_eq!(a.scope(), mn.scope);

        let mut buf = Vec::new();
        a.marshal(&mut buf);
        assert_eq!(buf.len(), Tsid::SIZE);
        assert_eq!(Tsid::unmarshal(&buf).unwrap(), a);
        assert!(Tsid::unmarshal(&buf[1..]).is_err());
    }

    #[test]
    fn test_tsid_sorts_by_metric_group_first() {
        let scope = Scope::new(1, 1);
        let a = Tsid::from_metric_name(&MetricName::new(scope, "cpu"), 100);
        let b = Tsid::from_metric_name(&MetricName::new(scope, "mem"), 1);
        assert_ne!(a.metric_group_id, b.metric_group_id);
        assert_eq!(a < b, a.metric_group_id < b.metric_group_id);

        let c = Tsid::from_metric_name(&MetricName::new(scope, "cpu"), 7);
        assert_eq!(a.metric_group_id, c.metric_group_id);
        assert!(c < a);
    }

    #[test]
    fn test_time_range_days() {
        let day = MSECS_PER_DAY;
        let range = TimeRange::new(day * 10, day * 12);
        assert_eq!(range.min_date(), 10);
        assert_eq!(range.max_date(), 11);
        assert_eq!(range.day_count(), 2);

        assert!(range.contains(day * 10));
        assert!(!range.contains(day * 12)); // end is exclusive

        let partial = TimeRange::new(day * 10 + 5, day * 10 + 6);
        assert_eq!(partial.day_count(), 1);

        assert_eq!(TimeRange::new(5, 5).day_count(), 0);
        assert_eq!(TimeRange::for_date(3).min_date(), 3);
        assert_eq!(TimeRange::for_date(3).max_date(), 3);
    }

    #[test]
    fn test_date_and_hour() {
        assert_eq!(date_from_timestamp(-5), 0);
        assert_eq!(date_from_timestamp(MSECS_PER_DAY + 1), 1);
        assert_eq!(hour_from_timestamp(MSECS_PER_HOUR * 3 - 1), 2);
    }
}
