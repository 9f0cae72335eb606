//! Label search
//!
//! Resolves tag filter sets to sorted metric ids. Each set is a conjunction,
//! several sets are OR-ed and evaluated in parallel.
//!
//! Per set and postings source:
//! 1. Positive filters are ordered by estimated cardinality and intersected,
//!    stopping at the first empty result.
//! 2. Without positive filters the source universe is the starting set.
//! 3. Subtracting filters remove the series whose value they reject.
//! 4. Filters whose estimate dwarfs the running result are checked against
//!    the candidates' identities instead of loading their postings.

use crate::error::{IndexError, Result};
use crate::index_db::IndexDb;
use crate::keys::{self, PostingsSource};
use crate::tag_filters::{FilterMode, TagFilter, TagFilters};
use ixdb_core::encoding::marshal_escaped;
use ixdb_core::{decode_identity, MetricId, Scope, TimeRange, METRIC_GROUP_TAG_KEY};
use rayon::prelude::*;
use roaring::RoaringTreemap;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rows visited between deadline checks
const DEADLINE_CHECK_INTERVAL: u64 = 4096;

/// Search limits
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Fail with `TooManyMatches` above this many series
    pub max_metrics: usize,
    /// Fail with `DeadlineExceeded` after this instant
    pub deadline: Option<Instant>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_metrics: 1_000_000,
            deadline: None,
        }
    }
}

impl SearchOptions {
    /// Set the series limit
    pub fn with_max_metrics(mut self, max_metrics: usize) -> Self {
        self.max_metrics = max_metrics;
        self
    }

    /// Set a deadline `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(IndexError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// What the executor did with one filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Postings intersected with the running result
    Intersect,
    /// Postings subtracted from the running result
    Subtract,
    /// Checked against the candidates' identities
    MatchMetricNames,
    /// Accepts every series
    Skip,
    /// Accepts no series
    Empty,
}

/// One executed filter with its estimate
#[derive(Debug, Clone, Serialize)]
pub struct FilterStep {
    pub filter: String,
    pub action: StepAction,
    pub estimate: u64,
}

/// Execution record of one filter set
#[derive(Debug, Clone, Serialize)]
pub struct FilterSetPlan {
    pub filters: String,
    /// Steps for the first evaluated postings source, in execution order
    pub steps: Vec<FilterStep>,
    pub matched: u64,
}

/// Execution record of a search, for EXPLAIN-style output
#[derive(Debug, Clone, Serialize)]
pub struct SearchPlan {
    pub time_range: TimeRange,
    /// Per-day rows were used instead of the global rows
    pub per_day: bool,
    pub day_count: u64,
    pub filter_sets: Vec<FilterSetPlan>,
    pub matched: u64,
}

impl SearchPlan {
    /// Human readable plan, one line per entry
    pub fn explain(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "source: {} ({} days), matched {} series",
            if self.per_day { "per-day" } else { "global" },
            self.day_count,
            self.matched
        )];
        for (i, set) in self.filter_sets.iter().enumerate() {
            lines.push(format!("set {}: {} -> {} series", i, set.filters, set.matched));
            for step in &set.steps {
                lines.push(format!(
                    "  {:?} {} (estimate {})",
                    step.action, step.filter, step.estimate
                ));
            }
        }
        lines
    }
}

impl fmt::Display for SearchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain().join("\n"))
    }
}

impl IndexDb {
    /// Metric ids matching any of the filter sets within `tr`, sorted
    pub fn search_metric_ids(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        opts: &SearchOptions,
    ) -> Result<Vec<MetricId>> {
        Ok(self.search_with_plan(tfss, tr, opts)?.0)
    }

    /// Same as [`IndexDb::search_metric_ids`], also returning the executed plan
    pub fn search_with_plan(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        opts: &SearchOptions,
    ) -> Result<(Vec<MetricId>, SearchPlan)> {
        let scope = common_scope(tfss)?;
        let day_count = tr.day_count();
        let per_day = day_count > 0 && day_count <= self.config.max_days_for_per_day_index;
        let mut plan = SearchPlan {
            time_range: tr,
            per_day,
            day_count,
            filter_sets: Vec::with_capacity(tfss.len()),
            matched: 0,
        };

        let scope = match scope {
            Some(scope) if !tr.is_empty() => scope,
            _ => return Ok((Vec::new(), plan)),
        };

        // Most recent day first
        let sources: Vec<PostingsSource> = if per_day {
            (tr.min_date()..=tr.max_date())
                .rev()
                .map(PostingsSource::Date)
                .collect()
        } else {
            vec![PostingsSource::Global]
        };

        let results = tfss
            .par_iter()
            .map(|tfs| self.search_filter_set(scope, tfs, &sources, opts))
            .collect::<Result<Vec<_>>>()?;

        let mut ids = RoaringTreemap::new();
        for (found, set_plan) in results {
            ids |= found;
            plan.filter_sets.push(set_plan);
        }
        if ids.len() > opts.max_metrics as u64 {
            return Err(too_many(opts, &describe_sets(tfss)));
        }

        plan.matched = ids.len();
        debug!("Search plan:\n{}", plan);
        Ok((ids.iter().collect(), plan))
    }

    /// Label names in use in `scope`, sorted
    pub fn search_tag_keys(&self, scope: Scope, max: usize) -> Result<Vec<Vec<u8>>> {
        let prefix = PostingsSource::Global.tag_prefix(scope);
        let mut found = Vec::new();
        let mut start = prefix.clone();

        while found.len() < max {
            let key = match self.first_string_from(&prefix, &start)? {
                Some(key) => key,
                None => break,
            };
            let mut escaped = Vec::new();
            marshal_escaped(&mut escaped, &key);
            start = keys::skip_past_terminated(&prefix, &escaped);

            found.push(if key.is_empty() {
                METRIC_GROUP_TAG_KEY.to_vec()
            } else {
                key
            });
        }

        found.sort();
        Ok(found)
    }

    /// Values of label `key` in use in `scope`, sorted
    pub fn search_tag_values(&self, scope: Scope, key: &[u8], max: usize) -> Result<Vec<Vec<u8>>> {
        let key = if key == METRIC_GROUP_TAG_KEY { &[][..] } else { key };
        let prefix = PostingsSource::Global.tag_key_prefix(scope, key);
        let mut values = Vec::new();
        let mut start = prefix.clone();

        while values.len() < max {
            let value = match self.first_string_from(&prefix, &start)? {
                Some(value) => value,
                None => break,
            };
            let mut escaped = Vec::new();
            marshal_escaped(&mut escaped, &value);
            start = keys::skip_past_terminated(&prefix, &escaped);
            values.push(value);
        }

        Ok(values)
    }

    /// Decode the escaped string following `prefix` in the first row at or
    /// after `start`
    fn first_string_from(&self, prefix: &[u8], start: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.store.scan_from(prefix, start, &mut |key, _| {
            found = Some(keys::parse_tag_key(&key[prefix.len()..]));
            false
        })?;
        found.transpose()
    }

    fn search_filter_set(
        &self,
        scope: Scope,
        tfs: &TagFilters,
        sources: &[PostingsSource],
        opts: &SearchOptions,
    ) -> Result<(RoaringTreemap, FilterSetPlan)> {
        let mut ids = RoaringTreemap::new();
        let mut steps = None;

        for source in sources {
            opts.check_deadline()?;
            let mut source_steps = Vec::new();
            let found = self.search_source(scope, tfs, *source, opts, &mut source_steps)?;
            ids |= found;
            if ids.len() > opts.max_metrics as u64 {
                return Err(too_many(opts, &tfs.to_string()));
            }
            if steps.is_none() {
                steps = Some(source_steps);
            }
        }

        let plan = FilterSetPlan {
            filters: tfs.to_string(),
            steps: steps.unwrap_or_default(),
            matched: ids.len(),
        };
        Ok((ids, plan))
    }

    fn search_source(
        &self,
        scope: Scope,
        tfs: &TagFilters,
        source: PostingsSource,
        opts: &SearchOptions,
        steps: &mut Vec<FilterStep>,
    ) -> Result<RoaringTreemap> {
        let max = opts.max_metrics as u64;
        let mut positives = Vec::new();
        let mut negatives = Vec::new();

        for filter in tfs.filters() {
            if filter.is_noop() {
                steps.push(step(filter, StepAction::Skip, 0));
                continue;
            }
            if filter.matches_nothing() {
                steps.push(step(filter, StepAction::Empty, 0));
                return Ok(RoaringTreemap::new());
            }
            let estimate = self.estimate_filter(source, scope, filter)?;
            match filter.mode() {
                FilterMode::Intersect => positives.push((filter, estimate)),
                FilterMode::Subtract => negatives.push((filter, estimate)),
            }
        }
        positives.sort_by_key(|(_, estimate)| *estimate);
        negatives.sort_by_key(|(_, estimate)| *estimate);

        let mut deferred: Vec<&TagFilter> = Vec::new();
        let mut result: Option<RoaringTreemap> = None;

        for (filter, estimate) in positives {
            opts.check_deadline()?;
            if let Some(current) = &result {
                if self.prefer_metric_names(estimate, current.len()) {
                    steps.push(step(filter, StepAction::MatchMetricNames, estimate));
                    deferred.push(filter);
                    continue;
                }
            }

            let postings = self.filter_postings(source, scope, filter, opts)?;
            steps.push(step(filter, StepAction::Intersect, estimate));
            let next = match result.take() {
                Some(mut current) => {
                    current &= &postings;
                    current
                }
                None => postings,
            };
            if next.is_empty() {
                return Ok(next);
            }
            if next.len() > max {
                return Err(too_many(opts, &tfs.to_string()));
            }
            result = Some(next);
        }

        let mut result = match result {
            Some(result) => result,
            None => self.load_universe(source, scope, tfs, opts)?,
        };

        for (filter, estimate) in negatives {
            if result.is_empty() {
                return Ok(result);
            }
            opts.check_deadline()?;
            if self.prefer_metric_names(estimate, result.len()) {
                steps.push(step(filter, StepAction::MatchMetricNames, estimate));
                deferred.push(filter);
                continue;
            }
            let postings = self.filter_postings(source, scope, filter, opts)?;
            steps.push(step(filter, StepAction::Subtract, estimate));
            result -= &postings;
        }

        if deferred.is_empty() || result.is_empty() {
            return Ok(result);
        }
        self.match_metric_names(scope, &result, &deferred, opts)
    }

    fn prefer_metric_names(&self, estimate: u64, candidates: u64) -> bool {
        let ratio = self.config.metric_name_match_ratio;
        ratio > 0 && estimate > candidates.saturating_mul(ratio)
    }

    fn load_universe(
        &self,
        source: PostingsSource,
        scope: Scope,
        tfs: &TagFilters,
        opts: &SearchOptions,
    ) -> Result<RoaringTreemap> {
        let max = opts.max_metrics as u64;
        let mut ids = RoaringTreemap::new();
        let mut failed = None;

        self.store
            .scan_prefix(&source.universe_prefix(scope), &mut |key, _| {
                match keys::parse_metric_id_suffix(key) {
                    Ok(id) => {
                        ids.insert(id);
                    }
                    Err(e) => {
                        failed = Some(e);
                        return false;
                    }
                }
                if ids.len() > max {
                    failed = Some(too_many(opts, &tfs.to_string()));
                    return false;
                }
                if ids.len() % DEADLINE_CHECK_INTERVAL == 0 {
                    if let Err(e) = opts.check_deadline() {
                        failed = Some(e);
                        return false;
                    }
                }
                true
            })?;

        match failed {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    /// Ids of the series the filter's mode selects
    fn filter_postings(
        &self,
        source: PostingsSource,
        scope: Scope,
        filter: &TagFilter,
        opts: &SearchOptions,
    ) -> Result<RoaringTreemap> {
        let mut ids = RoaringTreemap::new();
        let mut failed = None;

        if let Some(values) = filter.lookup_values() {
            for value in values.iter().filter(|v| !v.is_empty()) {
                let prefix = source.tag_value_prefix(scope, filter.key(), value);
                self.store.scan_prefix(&prefix, &mut |key, _| {
                    match keys::parse_metric_id_suffix(key) {
                        Ok(id) => {
                            ids.insert(id);
                            true
                        }
                        Err(e) => {
                            failed = Some(e);
                            false
                        }
                    }
                })?;
                if let Some(e) = failed.take() {
                    return Err(e);
                }
            }
            return Ok(ids);
        }

        let key_prefix_len = source.tag_key_prefix(scope, filter.key()).len();
        let scan_prefix = source.tag_value_prefix_hint(scope, filter.key(), filter.scan_prefix());
        let mut value = Vec::new();
        let mut last_value: Option<(Vec<u8>, bool)> = None;
        let mut visited = 0u64;

        self.store.scan_prefix(&scan_prefix, &mut |key, _| {
            visited += 1;
            if visited % DEADLINE_CHECK_INTERVAL == 0 {
                if let Err(e) = opts.check_deadline() {
                    failed = Some(e);
                    return false;
                }
            }

            let id = match keys::parse_tag_value_row(&mut value, &key[key_prefix_len..]) {
                Ok(id) => id,
                Err(e) => {
                    failed = Some(e);
                    return false;
                }
            };

            // Rows are sorted by value, so one verdict serves a whole run
            let cached = match &last_value {
                Some((last, verdict)) if *last == value => Some(*verdict),
                _ => None,
            };
            let selected = match cached {
                Some(verdict) => verdict,
                None => {
                    let verdict = filter.selects(&value);
                    last_value = Some((value.clone(), verdict));
                    verdict
                }
            };
            if selected {
                ids.insert(id);
            }
            true
        })?;

        match failed {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    fn estimate_filter(&self, source: PostingsSource, scope: Scope, filter: &TagFilter) -> Result<u64> {
        match filter.lookup_values() {
            Some(values) => {
                let mut total = 0u64;
                for value in values.iter().filter(|v| !v.is_empty()) {
                    total += self.estimate_range(&source.tag_value_prefix(scope, filter.key(), value))?;
                }
                Ok(total)
            }
            None => self.estimate_range(&source.tag_value_prefix_hint(
                scope,
                filter.key(),
                filter.scan_prefix(),
            )),
        }
    }

    /// Row count under `prefix`, capped, memoised until the cache fills up
    fn estimate_range(&self, prefix: &[u8]) -> Result<u64> {
        if let Some(count) = self.estimates.get(prefix) {
            return Ok(*count);
        }

        let cap = self.config.estimate_scan_cap.max(1);
        let mut count = 0u64;
        self.store.scan_prefix(prefix, &mut |_, _| {
            count += 1;
            count < cap
        })?;

        if self.estimates.len() >= self.config.estimate_cache_capacity {
            self.estimates.clear();
        }
        self.estimates.insert(prefix.to_vec(), count);
        Ok(count)
    }

    fn match_metric_names(
        &self,
        scope: Scope,
        candidates: &RoaringTreemap,
        filters: &[&TagFilter],
        opts: &SearchOptions,
    ) -> Result<RoaringTreemap> {
        let mut kept = RoaringTreemap::new();
        for (i, id) in candidates.iter().enumerate() {
            if i as u64 % DEADLINE_CHECK_INTERVAL == 0 {
                opts.check_deadline()?;
            }
            let raw = self.metric_name_bytes(scope, id)?;
            let mn = decode_identity(&raw)?;
            if filters.iter().all(|f| f.accepts(mn.get_tag_value(f.key()))) {
                kept.insert(id);
            }
        }
        Ok(kept)
    }
}

fn step(filter: &TagFilter, action: StepAction, estimate: u64) -> FilterStep {
    FilterStep {
        filter: filter.to_string(),
        action,
        estimate,
    }
}

fn too_many(opts: &SearchOptions, filters: &str) -> IndexError {
    IndexError::TooManyMatches {
        limit: opts.max_metrics,
        filters: filters.to_string(),
    }
}

fn describe_sets(tfss: &[TagFilters]) -> String {
    tfss.iter()
        .map(|tfs| tfs.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// The single scope shared by all filter sets
fn common_scope(tfss: &[TagFilters]) -> Result<Option<Scope>> {
    let mut scope: Option<Scope> = None;
    for tfs in tfss {
        match scope {
            None => scope = Some(tfs.scope()),
            Some(s) if s != tfs.scope() => {
                return Err(IndexError::InvalidFilter(format!(
                    "filter sets mix scopes {} and {}",
                    s,
                    tfs.scope()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(scope)
}
