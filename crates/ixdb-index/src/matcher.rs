//! Tag value matchers
//!
//! A filter value is compiled into a [`ValueMatcher`]. Regular expressions
//! are inspected first: a pattern that is a plain literal, an alternation of
//! literals or a literal followed by `.*` / `.+` gets a cheap matcher that the
//! search can also turn into direct lookups or a narrowed range scan.

use crate::error::{IndexError, Result};
use dashmap::DashMap;
use fxhash::FxHashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::bytes::Regex;
use std::fmt;
use std::sync::Arc;

/// Compiled programs keyed by the anchored pattern
static REGEX_CACHE: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

const REGEX_CACHE_MAX_ENTRIES: usize = 10_000;

/// Alternations with more literals than this are matched as regexps
const MAX_OR_VALUES: usize = 100;

/// Get or compile an anchored regex (cached process-wide).
///
/// `.` matches any byte including `\n`, as the `.*` and `.+` shortcuts do.
fn compile_anchored(expr: &str) -> Result<Regex> {
    let anchored = format!("(?s)^(?:{})$", expr);
    if let Some(re) = REGEX_CACHE.get(&anchored) {
        return Ok(re.clone());
    }

    let re = Regex::new(&anchored)
        .map_err(|e| IndexError::InvalidFilter(format!("invalid regexp {:?}: {}", expr, e)))?;
    if REGEX_CACHE.len() >= REGEX_CACHE_MAX_ENTRIES {
        REGEX_CACHE.clear();
    }
    REGEX_CACHE.insert(anchored, re.clone());
    Ok(re)
}

/// Decides whether a tag value is accepted
pub trait ValueMatcher: Send + Sync + fmt::Debug {
    /// Check a single value
    fn matches(&self, value: &[u8]) -> bool;

    /// Every accepted value starts with this prefix
    fn literal_prefix(&self) -> &[u8] {
        &[]
    }

    /// The complete list of accepted values, when it is small and known
    fn exact_values(&self) -> Option<&[Vec<u8>]> {
        None
    }

    /// Check if every value is accepted
    fn matches_all(&self) -> bool {
        false
    }
}

/// Accepts everything (`.*`)
#[derive(Debug, Default)]
pub struct MatchAll;

impl ValueMatcher for MatchAll {
    fn matches(&self, _value: &[u8]) -> bool {
        true
    }

    fn matches_all(&self) -> bool {
        true
    }
}

/// Accepts a fixed set of values
#[derive(Debug)]
pub struct LiteralSet {
    values: Vec<Vec<u8>>,
    prefix: Vec<u8>,
}

impl LiteralSet {
    /// Create a matcher accepting exactly `values`
    pub fn new(mut values: Vec<Vec<u8>>) -> Self {
        values.sort();
        values.dedup();
        let prefix = common_prefix(&values);
        Self { values, prefix }
    }
}

impl ValueMatcher for LiteralSet {
    fn matches(&self, value: &[u8]) -> bool {
        self.values
            .binary_search_by(|v| v.as_slice().cmp(value))
            .is_ok()
    }

    fn literal_prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn exact_values(&self) -> Option<&[Vec<u8>]> {
        Some(&self.values)
    }
}

/// Accepts values starting with a prefix (`foo.*`, `foo.+`)
#[derive(Debug)]
pub struct PrefixMatcher {
    prefix: Vec<u8>,
    non_empty_suffix: bool,
}

impl PrefixMatcher {
    pub fn new(prefix: Vec<u8>, non_empty_suffix: bool) -> Self {
        Self {
            prefix,
            non_empty_suffix,
        }
    }
}

impl ValueMatcher for PrefixMatcher {
    fn matches(&self, value: &[u8]) -> bool {
        value.starts_with(&self.prefix) && (!self.non_empty_suffix || value.len() > self.prefix.len())
    }

    fn literal_prefix(&self) -> &[u8] {
        &self.prefix
    }
}

/// General regexp with a literal prefix hint and a bounded result memo
pub struct RegexMatcher {
    source: String,
    re: Regex,
    prefix: Vec<u8>,
    memo: Mutex<FxHashMap<Vec<u8>, bool>>,
    memo_capacity: usize,
}

impl RegexMatcher {
    /// Compile `expr` anchored at both ends
    pub fn new(expr: &str, prefix: Vec<u8>, memo_capacity: usize) -> Result<Self> {
        Ok(Self {
            source: expr.to_string(),
            re: compile_anchored(expr)?,
            prefix,
            memo: Mutex::new(FxHashMap::default()),
            memo_capacity,
        })
    }
}

impl fmt::Debug for RegexMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegexMatcher")
            .field("source", &self.source)
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}

impl ValueMatcher for RegexMatcher {
    fn matches(&self, value: &[u8]) -> bool {
        if !value.starts_with(&self.prefix) {
            return false;
        }
        if self.memo_capacity == 0 {
            return self.re.is_match(value);
        }
        if let Some(&hit) = self.memo.lock().get(value) {
            return hit;
        }

        let ok = self.re.is_match(value);
        let mut memo = self.memo.lock();
        if memo.len() >= self.memo_capacity {
            memo.clear();
        }
        memo.insert(value.to_vec(), ok);
        ok
    }

    fn literal_prefix(&self) -> &[u8] {
        &self.prefix
    }
}

/// Compile a filter value into a matcher
pub fn compile(value: &[u8], is_regexp: bool, memo_capacity: usize) -> Result<Arc<dyn ValueMatcher>> {
    if !is_regexp {
        return Ok(Arc::new(LiteralSet::new(vec![value.to_vec()])));
    }

    let expr = std::str::from_utf8(value)
        .map_err(|_| IndexError::InvalidFilter(format!("regexp {:?} is not valid UTF-8", value)))?;

    // Validate the full pattern even when a shortcut applies
    compile_anchored(expr)?;

    if let Some(values) = or_values(expr) {
        return Ok(Arc::new(LiteralSet::new(
            values.into_iter().map(String::into_bytes).collect(),
        )));
    }

    let (prefix, rest) = literal_prefix(expr);
    match rest {
        ".*" if prefix.is_empty() => Ok(Arc::new(MatchAll)),
        ".*" => Ok(Arc::new(PrefixMatcher::new(prefix.into_bytes(), false))),
        ".+" => Ok(Arc::new(PrefixMatcher::new(prefix.into_bytes(), true))),
        _ => Ok(Arc::new(RegexMatcher::new(expr, prefix.into_bytes(), memo_capacity)?)),
    }
}

fn is_meta(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
    )
}

/// Check for a `|` outside groups and classes
fn has_top_level_alternation(expr: &str) -> bool {
    let mut depth = 0usize;
    let mut in_class = false;
    let mut chars = expr.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => depth = depth.saturating_sub(1),
            '|' if !in_class && depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Split a pattern into its leading literal text and the remaining pattern.
///
/// Patterns with a top-level alternation have no usable prefix.
pub fn literal_prefix(expr: &str) -> (String, &str) {
    if has_top_level_alternation(expr) {
        return (String::new(), expr);
    }

    let mut prefix = String::new();
    // Byte offset where the last literal item started, and the prefix length before it
    let mut last_item: Option<(usize, usize)> = None;
    let mut iter = expr.char_indices().peekable();

    while let Some(&(i, c)) = iter.peek() {
        match c {
            '?' | '*' | '{' | '+' => {
                // The quantifier applies to the previous literal item
                return match last_item {
                    Some((start, len)) => {
                        prefix.truncate(len);
                        (prefix, &expr[start..])
                    }
                    None => (prefix, &expr[i..]),
                };
            }
            '\\' => {
                let mut ahead = expr[i + 1..].chars();
                match ahead.next() {
                    Some(n) if n.is_ascii_punctuation() => {
                        last_item = Some((i, prefix.len()));
                        prefix.push(n);
                        iter.next();
                        iter.next();
                    }
                    _ => return (prefix, &expr[i..]),
                }
            }
            c if is_meta(c) => return (prefix, &expr[i..]),
            c => {
                last_item = Some((i, prefix.len()));
                prefix.push(c);
                iter.next();
            }
        }
    }

    (prefix, "")
}

/// Plain literal text of `expr`, or `None` if it contains any operator
fn as_literal(expr: &str) -> Option<String> {
    match literal_prefix(expr) {
        (lit, "") => Some(lit),
        _ => None,
    }
}

/// Exact values matched by `expr` when it is a literal, an alternation of
/// literals, or a literal followed by a group of literal alternatives
pub fn or_values(expr: &str) -> Option<Vec<String>> {
    if has_top_level_alternation(expr) {
        let values = split_alternatives(expr)?
            .into_iter()
            .map(as_literal)
            .collect::<Option<Vec<_>>>()?;
        return (values.len() <= MAX_OR_VALUES).then_some(values);
    }

    let (prefix, rest) = literal_prefix(expr);
    if rest.is_empty() {
        return Some(vec![prefix]);
    }

    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    let inner = inner.strip_prefix("?:").unwrap_or(inner);
    if inner.contains('(') || inner.contains(')') {
        return None;
    }
    let values = split_alternatives(inner)?
        .into_iter()
        .map(|alt| as_literal(alt).map(|lit| format!("{}{}", prefix, lit)))
        .collect::<Option<Vec<_>>>()?;
    (values.len() <= MAX_OR_VALUES).then_some(values)
}

/// Split on top-level `|`; `None` if groups or classes make it ambiguous
fn split_alternatives(expr: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut iter = expr.char_indices();
    while let Some((i, c)) = iter.next() {
        match c {
            '\\' => {
                iter.next();
            }
            '(' | ')' | '[' | ']' => return None,
            '|' => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    Some(parts)
}

fn common_prefix(values: &[Vec<u8>]) -> Vec<u8> {
    let first = match values.first() {
        Some(v) => v,
        None => return Vec::new(),
    };
    let mut len = first.len();
    for v in &values[1..] {
        len = len.min(first.iter().zip(v.iter()).take_while(|(a, b)| a == b).count());
    }
    first[..len].to_vec()
}
