//! Volatile time-series cache.
//!
//! Retention-bounded, append-mostly store keyed by instrument. Acts as the
//! write buffer ahead of the durable store and as the low-latency source for
//! the live tail of every reader view.
//!
//! - Each series is labelled `name=<instrument>` and `type=trading_instruments`
//!   and can be selected with label filters (`type=trading_instruments`,
//!   `name=(a,b)`), the same way a multi-series range scan is filtered.
//! - A sample is retained while `now - timestamp <= retention`. Expired samples
//!   are evicted on append and on read, so a range read never returns them.
//! - Series live behind their own lock: writers on different instruments never
//!   contend, and readers only hold one series lock at a time.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::models::{PriceSample, SeriesMap, TimestampMs, TRADING_INSTRUMENTS_TYPE};

/// Read/write surface the simulator, sync job and readers depend on.
pub trait PriceCache: Send + Sync {
    /// Insert one sample into its instrument's window.
    fn append(&self, sample: PriceSample) -> Result<AppendOutcome, PipelineError>;

    /// Samples with `from_ts <= timestamp <= to_ts`, per instrument, ascending.
    /// An empty `instruments` slice selects every known instrument.
    fn range(
        &self,
        instruments: &[String],
        from_ts: TimestampMs,
        to_ts: TimestampMs,
    ) -> Result<SeriesMap, PipelineError>;

    fn retention_ms(&self) -> i64;
}

/// What happened to an appended sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same `(instrument, timestamp)` already present; the first write is kept.
    Duplicate,
    /// Already outside the retention window; dropped.
    Expired,
}

// =============================================================================
// Label filters
// =============================================================================

/// Series selector, parsed from `label=value` or `label=(v1,v2,...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    Equals { label: String, value: String },
    OneOf { label: String, values: Vec<String> },
}

impl LabelFilter {
    pub fn parse(expr: &str) -> Result<Self, PipelineError> {
        let (label, value) = expr
            .split_once('=')
            .ok_or_else(|| PipelineError::DataShape(format!("filter '{}' has no '='", expr)))?;
        let label = label.trim();
        let value = value.trim();
        if label.is_empty() {
            return Err(PipelineError::DataShape(format!(
                "filter '{}' has an empty label",
                expr
            )));
        }

        if let Some(inner) = value.strip_prefix('(') {
            let inner = inner.strip_suffix(')').ok_or_else(|| {
                PipelineError::DataShape(format!("filter '{}' has an unclosed list", expr))
            })?;
            let values: Vec<String> = inner
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            return Ok(Self::OneOf {
                label: label.to_string(),
                values,
            });
        }

        Ok(Self::Equals {
            label: label.to_string(),
            value: value.to_string(),
        })
    }

    pub fn trading_instruments() -> Self {
        Self::Equals {
            label: "type".to_string(),
            value: TRADING_INSTRUMENTS_TYPE.to_string(),
        }
    }

    pub fn names(instruments: &[String]) -> Self {
        Self::OneOf {
            label: "name".to_string(),
            values: instruments.to_vec(),
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { label, value } => labels.get(label) == Some(value),
            Self::OneOf { label, values } => labels
                .get(label)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
        }
    }
}

// =============================================================================
// Series storage
// =============================================================================

struct Series {
    labels: BTreeMap<String, String>,
    window: Mutex<VecDeque<PriceSample>>,
}

impl Series {
    fn new(instrument: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("name".to_string(), instrument.to_string());
        labels.insert("type".to_string(), TRADING_INSTRUMENTS_TYPE.to_string());
        Self {
            labels,
            window: Mutex::new(VecDeque::new()),
        }
    }
}

/// Drop samples older than `cutoff` from the front. Returns how many went.
fn evict_before(window: &mut VecDeque<PriceSample>, cutoff: TimestampMs) -> usize {
    let expired = window.partition_point(|s| s.timestamp < cutoff);
    window.drain(..expired);
    expired
}

fn insert_ordered(window: &mut VecDeque<PriceSample>, sample: PriceSample) -> AppendOutcome {
    match window.back() {
        None => {
            window.push_back(sample);
            AppendOutcome::Appended
        }
        Some(last) if last.timestamp < sample.timestamp => {
            window.push_back(sample);
            AppendOutcome::Appended
        }
        Some(_) => match window.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
            Ok(_) => AppendOutcome::Duplicate,
            Err(pos) => {
                window.insert(pos, sample);
                AppendOutcome::Appended
            }
        },
    }
}

/// Cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub appended: AtomicU64,
    pub duplicates: AtomicU64,
    pub expired_on_append: AtomicU64,
    pub evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub appended: u64,
    pub duplicates: u64,
    pub expired_on_append: u64,
    pub evicted: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            expired_on_append: self.expired_on_append.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// In-process retention-bounded time-series cache.
pub struct TimeSeriesCache {
    series: RwLock<HashMap<String, Arc<Series>>>,
    retention_ms: i64,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl TimeSeriesCache {
    pub fn new(retention_ms: i64, clock: Arc<dyn Clock>) -> Self {
        debug!(retention_ms, "TimeSeriesCache initialized");
        Self {
            series: RwLock::new(HashMap::new()),
            retention_ms,
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Oldest timestamp still inside the retention window at `now`.
    #[inline]
    fn cutoff(&self, now: TimestampMs) -> TimestampMs {
        now - self.retention_ms
    }

    fn series_for(&self, instrument: &str) -> Arc<Series> {
        if let Some(series) = self.series.read().get(instrument) {
            return series.clone();
        }
        self.series
            .write()
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Series::new(instrument)))
            .clone()
    }

    /// Multi-series range read selected by label filter expressions.
    pub fn mrange(
        &self,
        from_ts: TimestampMs,
        to_ts: TimestampMs,
        filters: &[&str],
    ) -> Result<SeriesMap, PipelineError> {
        let filters = filters
            .iter()
            .map(|f| LabelFilter::parse(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.collect_range(from_ts, to_ts, &filters))
    }

    fn collect_range(
        &self,
        from_ts: TimestampMs,
        to_ts: TimestampMs,
        filters: &[LabelFilter],
    ) -> SeriesMap {
        let now = self.clock.now_millis();
        let cutoff = self.cutoff(now);
        let lo = from_ts.max(cutoff);
        let hi = to_ts.min(now);

        let mut result = SeriesMap::new();
        if lo > hi {
            return result;
        }

        // Snapshot handles first so the map lock is not held while copying.
        let selected: Vec<(String, Arc<Series>)> = self
            .series
            .read()
            .iter()
            .filter(|(_, s)| filters.iter().all(|f| f.matches(&s.labels)))
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect();

        for (name, series) in selected {
            let mut window = series.window.lock();
            let evicted = evict_before(&mut window, cutoff);
            if evicted > 0 {
                self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            }

            let start = window.partition_point(|s| s.timestamp < lo);
            let end = window.partition_point(|s| s.timestamp <= hi);
            if start < end {
                result.insert(name, window.range(start..end).cloned().collect());
            }
        }

        result
    }

    /// Known instruments, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Samples currently held for an instrument (expired ones included until
    /// the next append or read evicts them).
    pub fn held(&self, instrument: &str) -> usize {
        self.series
            .read()
            .get(instrument)
            .map(|s| s.window.lock().len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl PriceCache for TimeSeriesCache {
    fn append(&self, sample: PriceSample) -> Result<AppendOutcome, PipelineError> {
        let now = self.clock.now_millis();
        let cutoff = self.cutoff(now);
        if sample.timestamp < cutoff {
            self.stats.expired_on_append.fetch_add(1, Ordering::Relaxed);
            return Ok(AppendOutcome::Expired);
        }

        let series = self.series_for(&sample.instrument_id);
        let mut window = series.window.lock();
        let evicted = evict_before(&mut window, cutoff);
        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }

        let outcome = insert_ordered(&mut window, sample);
        match outcome {
            AppendOutcome::Appended => self.stats.appended.fetch_add(1, Ordering::Relaxed),
            AppendOutcome::Duplicate => self.stats.duplicates.fetch_add(1, Ordering::Relaxed),
            AppendOutcome::Expired => self.stats.expired_on_append.fetch_add(1, Ordering::Relaxed),
        };
        Ok(outcome)
    }

    fn range(
        &self,
        instruments: &[String],
        from_ts: TimestampMs,
        to_ts: TimestampMs,
    ) -> Result<SeriesMap, PipelineError> {
        let mut filters = vec![LabelFilter::trading_instruments()];
        if !instruments.is_empty() {
            filters.push(LabelFilter::names(instruments));
        }
        Ok(self.collect_range(from_ts, to_ts, &filters))
    }

    fn retention_ms(&self) -> i64 {
        self.retention_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_at(now: TimestampMs, retention_ms: i64) -> (Arc<ManualClock>, TimeSeriesCache) {
        let clock = Arc::new(ManualClock::new(now));
        let cache = TimeSeriesCache::new(retention_ms, clock.clone());
        (clock, cache)
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_range_returns_ordered_points() {
        let (clock, cache) = cache_at(0, 5);
        for (t, price) in [(1, 1), (2, 2), (3, 1), (4, 2)] {
            clock.set(t);
            cache.append(PriceSample::new("X", t, price)).unwrap();
        }

        let result = cache.range(&ids(&["X"]), 0, 4).unwrap();
        let points: Vec<_> = result["X"].iter().map(|s| (s.timestamp, s.price)).collect();
        assert_eq!(points, vec![(1, 1), (2, 2), (3, 1), (4, 2)]);
    }

    #[test]
    fn test_retention_boundary() {
        let retention = 5_000;
        let (clock, cache) = cache_at(10_000, retention);
        cache.append(PriceSample::new("X", 10_000, 1)).unwrap();

        clock.set(10_000 + retention - 1);
        assert_eq!(cache.range(&[], 0, i64::MAX).unwrap()["X"].len(), 1);

        clock.set(10_000 + retention);
        assert_eq!(cache.range(&[], 0, i64::MAX).unwrap()["X"].len(), 1);

        clock.set(10_000 + retention + 1);
        assert!(cache.range(&[], 0, i64::MAX).unwrap().is_empty());
        // Evicted, not hidden
        assert_eq!(cache.held("X"), 0);
        assert_eq!(cache.stats().snapshot().evicted, 1);
    }

    #[test]
    fn test_expired_append_is_dropped() {
        let (_clock, cache) = cache_at(100_000, 1_000);
        let outcome = cache.append(PriceSample::new("X", 1, 1)).unwrap();
        assert_eq!(outcome, AppendOutcome::Expired);
        assert_eq!(cache.held("X"), 0);
    }

    #[test]
    fn test_duplicate_keeps_first_write() {
        let (_clock, cache) = cache_at(10, 100);
        assert_eq!(
            cache.append(PriceSample::new("X", 5, 1)).unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            cache.append(PriceSample::new("X", 5, 99)).unwrap(),
            AppendOutcome::Duplicate
        );

        let result = cache.range(&[], 0, 10).unwrap();
        assert_eq!(result["X"], vec![PriceSample::new("X", 5, 1)]);
        assert_eq!(cache.stats().snapshot().duplicates, 1);
    }

    #[test]
    fn test_late_sample_inserted_in_order() {
        let (_clock, cache) = cache_at(10, 100);
        cache.append(PriceSample::new("X", 3, 3)).unwrap();
        cache.append(PriceSample::new("X", 7, 7)).unwrap();
        cache.append(PriceSample::new("X", 5, 5)).unwrap();
        cache.append(PriceSample::new("X", 5, 50)).unwrap();

        let ts: Vec<_> = cache.range(&[], 0, 10).unwrap()["X"]
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(ts, vec![3, 5, 7]);
    }

    #[test]
    fn test_empty_instrument_set_means_all() {
        let (_clock, cache) = cache_at(10, 100);
        cache.append(PriceSample::new("A", 1, 1)).unwrap();
        cache.append(PriceSample::new("B", 2, 1)).unwrap();
        cache.append(PriceSample::new("C", 3, 1)).unwrap();

        let all = cache.range(&[], 0, 10).unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), ids(&["A", "B", "C"]));

        let some = cache.range(&ids(&["A", "C", "missing"]), 0, 10).unwrap();
        assert_eq!(some.keys().cloned().collect::<Vec<_>>(), ids(&["A", "C"]));
    }

    #[test]
    fn test_range_never_returns_future_or_inverted() {
        let (_clock, cache) = cache_at(10, 100);
        cache.append(PriceSample::new("X", 10, 1)).unwrap();
        assert!(cache.range(&[], 8, 5).unwrap().is_empty());
        assert_eq!(cache.range(&[], 10, 10).unwrap()["X"].len(), 1);
    }

    #[test]
    fn test_mrange_filters() {
        let (_clock, cache) = cache_at(10, 100);
        cache.append(PriceSample::new("A", 1, 1)).unwrap();
        cache.append(PriceSample::new("B", 1, 1)).unwrap();

        let typed = cache.mrange(0, 10, &["type=trading_instruments"]).unwrap();
        assert_eq!(typed.len(), 2);

        let named = cache
            .mrange(0, 10, &["type=trading_instruments", "name=(B)"])
            .unwrap();
        assert_eq!(named.keys().cloned().collect::<Vec<_>>(), ids(&["B"]));

        let other = cache.mrange(0, 10, &["type=commodities"]).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_malformed_filter_is_data_shape_error() {
        let (_clock, cache) = cache_at(10, 100);
        for bad in ["type", "=x", "name=(a,b"] {
            let err = cache.mrange(0, 10, &[bad]).unwrap_err();
            assert!(matches!(err, PipelineError::DataShape(_)), "{}", bad);
        }
    }

    #[test]
    fn test_concurrent_writers_keep_series_ordered() {
        let (_clock, cache) = cache_at(1_000_000, 10_000_000);
        let cache = Arc::new(cache);
        let instruments = ["A", "B", "C", "D"];

        let writers: Vec<_> = instruments
            .iter()
            .map(|name| {
                let cache = cache.clone();
                let name = name.to_string();
                std::thread::spawn(move || {
                    for t in 0..2_000 {
                        cache.append(PriceSample::new(name.clone(), t, t)).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    for points in cache.range(&[], 0, i64::MAX).unwrap().values() {
                        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        let result = cache.range(&[], 0, i64::MAX).unwrap();
        for name in instruments {
            assert_eq!(result[name].len(), 2_000);
        }
    }
}
