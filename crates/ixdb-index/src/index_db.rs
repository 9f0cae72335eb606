//! Index database - series registration and reverse lookups
//!
//! Registration path for one sample:
//! 1. identity -> TSID cache; per-day rows are skipped when the hourly
//!    active set already saw the id on that date
//! 2. forward row lookup in the store
//! 3. allocate a new metric id and commit all rows of the series in one batch
//!
//! Concurrent first-time registrations of one identity may both reach step 3
//! unless strict registration is enabled. Both batches are complete and the
//! later forward row wins, so lookups converge on one id.

use crate::cache::IndexCaches;
use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::keys::{self, PostingsSource, NS_DATE};
use dashmap::DashMap;
use ixdb_core::encoding::read_u64_be;
use ixdb_core::{
    date_from_timestamp, decode_identity, hour_from_timestamp, now_millis, MetricId, MetricName,
    Scope, Timestamp, Tsid,
};
use ixdb_storage::{KvStore, WriteBatch};
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Metric ids start here on an empty store
const FIRST_METRIC_ID: MetricId = 1;

const HOURS_PER_DAY: u64 = 24;

#[derive(Debug)]
struct IdAllocator {
    next: MetricId,
    reserved_until: MetricId,
}

/// Registration statistics
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Series created since open
    pub series_created: u64,
    /// Resolves answered by the TSID cache
    pub cache_hits: u64,
    /// Resolves answered by a forward row
    pub store_hits: u64,
    /// Per-day row sets written for already known series
    pub per_day_writes: u64,
    /// Next metric id to hand out
    pub next_metric_id: MetricId,
    /// Cached cardinality estimates
    pub estimates: usize,
}

#[derive(Default)]
struct Counters {
    series_created: AtomicU64,
    cache_hits: AtomicU64,
    store_hits: AtomicU64,
    per_day_writes: AtomicU64,
}

/// Series identity index over a [`KvStore`]
pub struct IndexDb {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) caches: IndexCaches,
    pub(crate) config: IndexConfig,
    allocator: Mutex<IdAllocator>,
    /// Row counts per key prefix, used to order filters
    pub(crate) estimates: DashMap<Vec<u8>, u64>,
    registration_locks: Vec<Mutex<()>>,
    counters: Counters,
}

impl IndexDb {
    /// Open the index on top of `store`.
    ///
    /// Restores the allocator high-water mark and rebuilds the hourly active
    /// set from today's per-day rows.
    pub fn open(store: Arc<dyn KvStore>, caches: IndexCaches, config: IndexConfig) -> Result<Self> {
        let high_water = match store.get(&keys::next_id_key())? {
            Some(raw) => read_u64_be(&raw)?.0,
            None => FIRST_METRIC_ID,
        };

        let stripes = config.registration_lock_stripes.max(1);
        let db = Self {
            store,
            caches,
            config,
            allocator: Mutex::new(IdAllocator {
                next: high_water,
                reserved_until: high_water,
            }),
            estimates: DashMap::new(),
            registration_locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            counters: Counters::default(),
        };

        let active = db.rebuild_active_set(now_millis())?;
        info!(
            "Opened index: next metric id {}, {} series active today",
            high_water, active
        );
        Ok(db)
    }

    /// Get the configuration
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Get the shared caches
    pub fn caches(&self) -> &IndexCaches {
        &self.caches
    }

    /// Resolve an encoded identity to its TSID, registering it on first sight.
    ///
    /// `timestamp` is the sample time in milliseconds; it selects the day
    /// whose per-day rows are ensured. The hourly active set follows the
    /// wall clock, so only samples dated today are recorded there.
    pub fn get_or_create_tsid(&self, encoded: &[u8], timestamp: Timestamp) -> Result<Tsid> {
        let date = date_from_timestamp(timestamp);
        let hour = hour_from_timestamp(now_millis());
        self.caches.hours.rotate_if_needed(hour);

        if let Some(tsid) = self.caches.tsid.get(encoded) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.ensure_per_day_rows(encoded, &tsid, date, hour)?;
            return Ok(tsid);
        }

        if let Some(tsid) = self.lookup_tsid(encoded)? {
            self.counters.store_hits.fetch_add(1, Ordering::Relaxed);
            self.remember(encoded, &tsid);
            self.ensure_per_day_rows(encoded, &tsid, date, hour)?;
            return Ok(tsid);
        }

        let mn = decode_identity(encoded)?;
        let tsid = if self.config.strict_registration {
            let _guard = self.registration_lock(encoded).lock();
            match self.lookup_tsid(encoded)? {
                Some(tsid) => {
                    self.remember(encoded, &tsid);
                    self.ensure_per_day_rows(encoded, &tsid, date, hour)?;
                    return Ok(tsid);
                }
                None => self.create_series(&mn, encoded, date)?,
            }
        } else {
            self.create_series(&mn, encoded, date)?
        };

        self.remember(encoded, &tsid);
        self.mark_active(tsid.metric_id, date, hour);
        Ok(tsid)
    }

    /// Identity of a registered series
    pub fn search_metric_name(&self, scope: Scope, metric_id: MetricId) -> Result<MetricName> {
        let raw = self.metric_name_bytes(scope, metric_id)?;
        Ok(decode_identity(&raw)?)
    }

    /// TSID of a registered series
    pub fn get_tsid_by_metric_id(&self, scope: Scope, metric_id: MetricId) -> Result<Tsid> {
        match self.store.get(&keys::id_tsid_key(scope, metric_id))? {
            Some(raw) => Ok(Tsid::unmarshal(&raw)?),
            None => Err(IndexError::NotFound { scope, metric_id }),
        }
    }

    /// Number of series registered in `scope`
    pub fn series_count(&self, scope: Scope) -> Result<u64> {
        let mut count = 0u64;
        self.store
            .scan_prefix(&PostingsSource::Global.universe_prefix(scope), &mut |_, _| {
                count += 1;
                true
            })?;
        Ok(count)
    }

    /// Make every registration durable
    pub fn flush(&self) -> Result<()> {
        Ok(self.store.flush()?)
    }

    /// Get registration statistics
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            series_created: self.counters.series_created.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            store_hits: self.counters.store_hits.load(Ordering::Relaxed),
            per_day_writes: self.counters.per_day_writes.load(Ordering::Relaxed),
            next_metric_id: self.allocator.lock().next,
            estimates: self.estimates.len(),
        }
    }

    /// Encoded identity of a series, via the cache
    pub(crate) fn metric_name_bytes(&self, scope: Scope, metric_id: MetricId) -> Result<Vec<u8>> {
        if let Some(raw) = self.caches.metric_name.get(&(scope, metric_id)) {
            return Ok(raw);
        }
        match self.store.get(&keys::id_name_key(scope, metric_id))? {
            Some(raw) => {
                self.caches.metric_name.set((scope, metric_id), raw.clone());
                Ok(raw)
            }
            None => Err(IndexError::NotFound { scope, metric_id }),
        }
    }

    fn lookup_tsid(&self, encoded: &[u8]) -> Result<Option<Tsid>> {
        match self.store.get(&keys::name_key(encoded))? {
            Some(raw) => Ok(Some(Tsid::unmarshal(&raw)?)),
            None => Ok(None),
        }
    }

    fn remember(&self, encoded: &[u8], tsid: &Tsid) {
        self.caches.tsid.set(encoded.to_vec(), *tsid);
        self.caches
            .metric_name
            .set((tsid.scope(), tsid.metric_id), encoded.to_vec());
    }

    fn registration_lock(&self, encoded: &[u8]) -> &Mutex<()> {
        let stripe = fxhash::hash64(encoded) as usize % self.registration_locks.len();
        &self.registration_locks[stripe]
    }

    fn ensure_per_day_rows(&self, encoded: &[u8], tsid: &Tsid, date: u64, hour: u64) -> Result<()> {
        if self.caches.hours.contains_for_date(tsid.metric_id, date) {
            return Ok(());
        }

        let scope = tsid.scope();
        let source = PostingsSource::Date(date);
        if !self.store.contains(&source.universe_key(scope, tsid.metric_id))? {
            let mn = decode_identity(encoded)?;
            let mut batch = WriteBatch::new();
            let mut touched = Vec::new();
            stage_source_rows(&mut batch, &mut touched, source, &mn, tsid.metric_id);
            self.store.write_batch(batch)?;
            self.bump_estimates(&touched);
            self.counters.per_day_writes.fetch_add(1, Ordering::Relaxed);
        }

        self.mark_active(tsid.metric_id, date, hour);
        Ok(())
    }

    /// Record `id` in the wall-clock `hour` slot when its per-day rows for
    /// `date` exist and `date` is that hour's day
    fn mark_active(&self, id: MetricId, date: u64, hour: u64) {
        if date == hour / HOURS_PER_DAY {
            self.caches.hours.add(id, hour);
        }
    }

    fn create_series(&self, mn: &MetricName, encoded: &[u8], date: u64) -> Result<Tsid> {
        let metric_id = self.next_metric_id()?;
        let tsid = Tsid::from_metric_name(mn, metric_id);
        let scope = mn.scope;

        let mut tsid_bytes = Vec::with_capacity(Tsid::SIZE);
        tsid.marshal(&mut tsid_bytes);

        let mut batch = WriteBatch::with_capacity(4 + 2 * (mn.tags.len() + 1));
        let mut touched = Vec::new();
        batch.put(keys::name_key(encoded), tsid_bytes.clone());
        batch.put(keys::id_name_key(scope, metric_id), encoded.to_vec());
        stage_source_rows(&mut batch, &mut touched, PostingsSource::Global, mn, metric_id);
        // The global universe row carries the TSID
        batch.put(keys::id_tsid_key(scope, metric_id), tsid_bytes);
        stage_source_rows(&mut batch, &mut touched, PostingsSource::Date(date), mn, metric_id);

        self.store.write_batch(batch)?;
        self.bump_estimates(&touched);
        self.counters.series_created.fetch_add(1, Ordering::Relaxed);
        debug!("Registered series {} as metric id {}", mn, metric_id);
        Ok(tsid)
    }

    fn next_metric_id(&self) -> Result<MetricId> {
        let mut alloc = self.allocator.lock();
        if alloc.next >= alloc.reserved_until {
            let reserved_until = alloc.next + self.config.id_block_size.max(1);
            let mut batch = WriteBatch::new();
            batch.put(keys::next_id_key(), reserved_until.to_be_bytes().to_vec());
            self.store.write_batch(batch)?;
            self.store.flush()?;
            alloc.reserved_until = reserved_until;
            debug!("Reserved metric ids up to {}", reserved_until);
        }
        let id = alloc.next;
        alloc.next += 1;
        Ok(id)
    }

    /// Count each written row in every memoised range that covers it
    fn bump_estimates(&self, rows: &[Vec<u8>]) {
        if self.estimates.is_empty() {
            return;
        }
        for row in rows {
            for len in 1..=row.len() {
                if let Some(mut count) = self.estimates.get_mut(&row[..len]) {
                    *count += 1;
                }
            }
        }
    }

    /// Load ids with per-day rows for the current day into the hourly set
    fn rebuild_active_set(&self, now: Timestamp) -> Result<u64> {
        let date = date_from_timestamp(now);
        let mut ids = RoaringTreemap::new();
        let mut cursor = vec![NS_DATE];

        // Skip-scan: one scope per iteration
        loop {
            let mut scope = None;
            self.store.scan_from(&[NS_DATE], &cursor, &mut |key, _| {
                scope = Scope::unmarshal(&key[1..]).ok().map(|(s, _)| s);
                false
            })?;
            let scope = match scope {
                Some(scope) => scope,
                None => break,
            };

            let prefix = PostingsSource::Date(date).universe_prefix(scope);
            let mut failed = None;
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
            if let Some(e) = failed {
                return Err(e);
            }

            match next_scope(scope) {
                Some(next) => {
                    cursor.truncate(1);
                    next.marshal(&mut cursor);
                }
                None => break,
            }
        }

        let count = ids.len();
        self.caches.hours.rebuild(hour_from_timestamp(now), ids);
        Ok(count)
    }
}

fn next_scope(scope: Scope) -> Option<Scope> {
    let packed = ((scope.account_id as u64) << 32) | scope.project_id as u64;
    let next = packed.checked_add(1)?;
    Some(Scope::new((next >> 32) as u32, next as u32))
}

/// Stage the universe row (for per-day sources) and the tag rows of one
/// series, recording every row key that counts towards an estimate
fn stage_source_rows(
    batch: &mut WriteBatch,
    touched: &mut Vec<Vec<u8>>,
    source: PostingsSource,
    mn: &MetricName,
    metric_id: MetricId,
) {
    let scope = mn.scope;
    let universe = source.universe_key(scope, metric_id);
    if let PostingsSource::Date(_) = source {
        batch.put(universe.clone(), Vec::new());
    }
    touched.push(universe);

    let tags = std::iter::once((&[][..], mn.metric_group.as_slice()))
        .chain(mn.tags.iter().map(|t| (t.key.as_slice(), t.value.as_slice())));
    for (key, value) in tags {
        // Empty values are equivalent to absent tags
        if value.is_empty() {
            continue;
        }
        let row = source.tag_row_key(scope, key, value, metric_id);
        batch.put(row.clone(), Vec::new());
        touched.push(row);
    }
}
