//! Tag filters
//!
//! A series without a tag is treated as having the empty value for it. A
//! filter that accepts the empty value therefore also accepts every series
//! lacking the tag, so it is evaluated by subtracting the series whose value
//! is rejected. Every other filter is a positive set of the series whose value
//! is accepted.

use crate::error::{IndexError, Result};
use crate::matcher::{self, ValueMatcher};
use ixdb_core::{Scope, METRIC_GROUP_TAG_KEY};
use std::fmt;
use std::sync::Arc;

/// Default per-filter memo size for regexp results
pub const DEFAULT_MATCH_CACHE_SIZE: usize = 10_000;

/// How a filter combines with the running result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Keep series whose value is accepted
    Intersect,
    /// Remove series whose value is rejected
    Subtract,
}

/// A single compiled tag filter
#[derive(Clone)]
pub struct TagFilter {
    key: Vec<u8>,
    value: Vec<u8>,
    is_negative: bool,
    is_regexp: bool,
    matcher: Arc<dyn ValueMatcher>,
    matches_empty: bool,
}

impl TagFilter {
    /// Compile a filter. The empty key and `__name__` address the metric group.
    pub fn new(
        key: &[u8],
        value: &[u8],
        is_negative: bool,
        is_regexp: bool,
        match_cache_size: usize,
    ) -> Result<Self> {
        let key = if key == METRIC_GROUP_TAG_KEY { &[][..] } else { key };
        if key.is_empty() && value.is_empty() {
            return Err(IndexError::InvalidFilter(format!(
                "metric group filter {} needs a non-empty value",
                describe(key, value, is_negative, is_regexp)
            )));
        }

        let matcher = matcher::compile(value, is_regexp, match_cache_size)?;
        let matches_empty = matcher.matches(b"") != is_negative;
        Ok(Self {
            key: key.to_vec(),
            value: value.to_vec(),
            is_negative,
            is_regexp,
            matcher,
            matches_empty,
        })
    }

    /// Tag key; empty for the metric group
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Filter value as written
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    pub fn is_regexp(&self) -> bool {
        self.is_regexp
    }

    /// Check if the filter accepts the empty value (and so absent tags)
    pub fn matches_empty(&self) -> bool {
        self.matches_empty
    }

    /// The compiled value matcher
    pub fn matcher(&self) -> &Arc<dyn ValueMatcher> {
        &self.matcher
    }

    /// Check a tag value; `None` means the tag is absent
    pub fn accepts(&self, value: Option<&[u8]>) -> bool {
        self.matcher.matches(value.unwrap_or(b"")) != self.is_negative
    }

    /// Intersect or subtract
    pub fn mode(&self) -> FilterMode {
        if self.matches_empty {
            FilterMode::Subtract
        } else {
            FilterMode::Intersect
        }
    }

    /// Filter that keeps every series (`k=~".*"`)
    pub fn is_noop(&self) -> bool {
        self.matcher.matches_all() && !self.is_negative
    }

    /// Filter that keeps no series (`k!~".*"`)
    pub fn matches_nothing(&self) -> bool {
        self.matcher.matches_all() && self.is_negative
    }

    /// Whether the values this filter's mode looks up are the values the
    /// matcher accepts (rather than the ones it rejects)
    pub(crate) fn looks_up_matcher_values(&self) -> bool {
        (self.mode() == FilterMode::Intersect) != self.is_negative
    }

    /// Exact values whose postings the mode needs, when enumerable
    pub(crate) fn lookup_values(&self) -> Option<&[Vec<u8>]> {
        if self.looks_up_matcher_values() {
            self.matcher.exact_values()
        } else {
            None
        }
    }

    /// Literal prefix narrowing the value scan for the mode
    pub(crate) fn scan_prefix(&self) -> &[u8] {
        if self.looks_up_matcher_values() {
            self.matcher.literal_prefix()
        } else {
            &[]
        }
    }

    /// Predicate on indexed (non-empty) values selecting the rows the mode
    /// intersects with or subtracts
    pub(crate) fn selects(&self, value: &[u8]) -> bool {
        match self.mode() {
            FilterMode::Intersect => self.accepts(Some(value)),
            FilterMode::Subtract => !self.accepts(Some(value)),
        }
    }
}

fn describe(key: &[u8], value: &[u8], is_negative: bool, is_regexp: bool) -> String {
    let op = match (is_negative, is_regexp) {
        (false, false) => "=",
        (true, false) => "!=",
        (false, true) => "=~",
        (true, true) => "!~",
    };
    let key = if key.is_empty() {
        "__name__".into()
    } else {
        String::from_utf8_lossy(key)
    };
    format!("{}{}{:?}", key, op, String::from_utf8_lossy(value))
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe(
            &self.key,
            &self.value,
            self.is_negative,
            self.is_regexp,
        ))
    }
}

impl fmt::Debug for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagFilter({})", self)
    }
}

/// Conjunction of tag filters within one scope
#[derive(Debug, Clone)]
pub struct TagFilters {
    scope: Scope,
    filters: Vec<TagFilter>,
    match_cache_size: usize,
}

impl TagFilters {
    /// Create an empty filter list
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            filters: Vec::new(),
            match_cache_size: DEFAULT_MATCH_CACHE_SIZE,
        }
    }

    /// Set the regexp memo size used by filters added afterwards
    pub fn with_match_cache_size(mut self, size: usize) -> Self {
        self.match_cache_size = size;
        self
    }

    /// Add a filter
    pub fn add(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<()> {
        let filter = TagFilter::new(
            key.as_ref(),
            value.as_ref(),
            is_negative,
            is_regexp,
            self.match_cache_size,
        )?;
        self.filters.push(filter);
        Ok(())
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn filters(&self) -> &[TagFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Drop all filters, keeping the scope
    pub fn reset(&mut self) {
        self.filters.clear();
    }
}

impl fmt::Display for TagFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", filter)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(key: &str, value: &str, neg: bool, re: bool) -> TagFilter {
        TagFilter::new(key.as_bytes(), value.as_bytes(), neg, re, 16).unwrap()
    }

    #[test]
    fn test_modes() {
        assert_eq!(filter("i", "1", false, false).mode(), FilterMode::Intersect);
        assert_eq!(filter("i", "1", true, false).mode(), FilterMode::Subtract);
        assert_eq!(filter("i", "", false, false).mode(), FilterMode::Subtract);
        assert_eq!(filter("i", "", true, false).mode(), FilterMode::Intersect);
        assert_eq!(filter("i", "", false, true).mode(), FilterMode::Subtract);
        assert_eq!(filter("i", ".+", false, true).mode(), FilterMode::Intersect);
        assert_eq!(filter("i", "2.*", true, true).mode(), FilterMode::Subtract);
        assert_eq!(filter("i", "a|", false, true).mode(), FilterMode::Subtract);
    }

    #[test]
    fn test_absent_tag_is_empty_value() {
        let ne = filter("i", "x", true, false);
        assert!(ne.accepts(None));
        assert!(!ne.accepts(Some(b"x")));

        let eq_empty = filter("i", "", false, false);
        assert!(eq_empty.accepts(None));
        assert!(!eq_empty.accepts(Some(b"x")));
    }

    #[test]
    fn test_lookup_values_follow_mode() {
        // k!="v" subtracts exactly k="v"
        let ne = filter("k", "v", true, false);
        assert_eq!(ne.lookup_values().unwrap(), &[b"v".to_vec()][..]);
        assert!(ne.selects(b"v"));
        assert!(!ne.selects(b"w"));

        // k="" subtracts every non-empty value, which is not enumerable
        let eq_empty = filter("k", "", false, false);
        assert!(eq_empty.lookup_values().is_none());
        assert!(eq_empty.selects(b"anything"));

        // k!~"2.*" subtracts values starting with 2, narrowed by prefix
        let nre = filter("k", "2.*", true, true);
        assert_eq!(nre.scan_prefix(), b"2");
        assert!(nre.selects(b"20"));

        // k!="" keeps every non-empty value
        let ne_empty = filter("k", "", true, false);
        assert!(ne_empty.lookup_values().is_none());
        assert_eq!(ne_empty.scan_prefix(), b"");
        assert!(ne_empty.selects(b"x"));
    }

    #[test]
    fn test_match_all_shortcuts() {
        assert!(filter("k", ".*", false, true).is_noop());
        assert!(filter("k", ".*", true, true).matches_nothing());
        assert!(!filter("k", ".+", false, true).is_noop());
    }

    #[test]
    fn test_metric_group_key_normalized() {
        let f = filter("__name__", "cpu", false, false);
        assert!(f.key().is_empty());
        assert_eq!(f.to_string(), "__name__=\"cpu\"");
    }

    #[test]
    fn test_invalid_filters() {
        for key in ["", "__name__"] {
            assert!(matches!(
                TagFilter::new(key.as_bytes(), b"", false, false, 16),
                Err(IndexError::InvalidFilter(_))
            ));
        }
        assert!(matches!(
            TagFilter::new(b"k", b"[", false, true, 16),
            Err(IndexError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_tag_filters_display() {
        let mut tfs = TagFilters::new(Scope::new(1, 2));
        tfs.add("n", "1", false, false).unwrap();
        tfs.add("i", "2.*", true, true).unwrap();
        assert_eq!(tfs.len(), 2);
        assert_eq!(tfs.to_string(), "{n=\"1\", i!~\"2.*\"}");
    }
}
