//! Durable sync job.
//!
//! Single sequential loop: read everything new from the cache, insert-or-ignore
//! it into the durable store, advance the cursor, sleep a fixed interval.
//!
//! The cursor is process-local. After a restart the first cycle re-reads the
//! whole retention window, which is harmless because writes are idempotent.
//! A cycle that fails (or panics) is logged and abandoned; the cursor only
//! moves after a successful write, so the next cycle retries the same span.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::PriceCache;
use crate::clock::Clock;
use crate::error::{panic_reason, PipelineError};
use crate::models::{flatten_series, TimestampMs};
use crate::store::DurableStore;

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Samples read from the cache.
    pub read: usize,
    /// Rows that were new to the store.
    pub inserted: usize,
    pub cursor: Option<TimestampMs>,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub cycles: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub rows_inserted: AtomicU64,
}

pub struct DurableSync {
    cache: Arc<dyn PriceCache>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    /// Instruments to sync; empty syncs every series in the cache.
    instruments: Vec<String>,
    interval: Duration,
    /// How far before the cursor the next read starts.
    overlap_ms: i64,
    cursor: Option<TimestampMs>,
    stats: SyncStats,
}

impl DurableSync {
    pub fn new(
        cache: Arc<dyn PriceCache>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            instruments: Vec::new(),
            interval,
            overlap_ms: 0,
            cursor: None,
            stats: SyncStats::default(),
        }
    }

    pub fn with_instruments(mut self, instruments: Vec<String>) -> Self {
        self.instruments = instruments;
        self
    }

    pub fn with_overlap(mut self, overlap: Duration) -> Self {
        self.overlap_ms = overlap.as_millis() as i64;
        self
    }

    pub fn cursor(&self) -> Option<TimestampMs> {
        self.cursor
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Lower bound of the next cache read.
    fn read_from(&self, now: TimestampMs) -> TimestampMs {
        let window_start = now - self.cache.retention_ms();
        match self.cursor {
            Some(cursor) => (cursor - self.overlap_ms).max(window_start),
            None => window_start,
        }
    }

    /// One read → write → advance pass.
    pub fn run_cycle(&mut self) -> Result<SyncReport, PipelineError> {
        let now = self.clock.now_millis();
        let from = self.read_from(now);
        let series = self.cache.range(&self.instruments, from, now)?;

        // Min across instruments of each instrument's newest sample, so a
        // sparse instrument never lets the cursor skip past its own data.
        let candidate = series
            .values()
            .filter_map(|points| points.last().map(|s| s.timestamp))
            .min();

        let samples = flatten_series(series);
        if samples.is_empty() {
            info!(from, to = now, "No new prices to sync");
            return Ok(SyncReport {
                read: 0,
                inserted: 0,
                cursor: self.cursor,
            });
        }

        let inserted = self.store.insert_ignore(&samples)?;

        if let Some(candidate) = candidate {
            self.cursor = Some(self.cursor.map_or(candidate, |c| c.max(candidate)));
        }
        self.stats
            .rows_inserted
            .fetch_add(inserted as u64, Ordering::Relaxed);

        info!(
            read = samples.len(),
            inserted,
            cursor = ?self.cursor,
            "Synced prices to durable store"
        );
        Ok(SyncReport {
            read: samples.len(),
            inserted,
            cursor: self.cursor,
        })
    }

    /// Loop until shutdown. Returns the job so callers can inspect final state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!(
            interval_secs = self.interval.as_secs(),
            overlap_ms = self.overlap_ms,
            "Durable sync started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
            match catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Sync cycle failed");
                }
                Err(panic) => {
                    self.stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                    error!(reason = %panic_reason(panic.as_ref()), "Sync cycle panicked");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cursor = ?self.cursor, "Durable sync stopped");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TimeSeriesCache;
    use crate::clock::ManualClock;
    use crate::models::PriceSample;
    use crate::store::SqlitePriceStore;
    use std::sync::atomic::AtomicUsize;

    /// Store that fails (or panics) for the first N batches.
    struct BrokenStore {
        inner: SqlitePriceStore,
        remaining: AtomicUsize,
        panic: bool,
    }

    impl DurableStore for BrokenStore {
        fn insert_ignore(&self, samples: &[PriceSample]) -> Result<usize, PipelineError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.store(left - 1, Ordering::SeqCst);
                if self.panic {
                    panic!("store driver crashed");
                }
                return Err(PipelineError::store("database is locked"));
            }
            self.inner.insert_ignore(samples)
        }

        fn query(
            &self,
            instruments: &[String],
            from_ts: TimestampMs,
            to_ts: TimestampMs,
        ) -> Result<Vec<PriceSample>, PipelineError> {
            self.inner.query(instruments, from_ts, to_ts)
        }
    }

    fn scenario_cache(clock: &Arc<ManualClock>) -> Arc<TimeSeriesCache> {
        let cache = Arc::new(TimeSeriesCache::new(5, clock.clone()));
        for (t, price) in [(1, 1), (2, 2), (3, 1), (4, 2)] {
            clock.set(t);
            cache.append(PriceSample::new("X", t, price)).unwrap();
        }
        cache
    }

    #[test]
    fn test_second_run_without_new_samples_inserts_nothing() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = scenario_cache(&clock);
        let store = Arc::new(SqlitePriceStore::open_memory().unwrap());
        let mut sync = DurableSync::new(cache, store.clone(), clock.clone(), Duration::from_secs(60))
            .with_overlap(Duration::from_millis(1));

        let first = sync.run_cycle().unwrap();
        assert_eq!((first.read, first.inserted, first.cursor), (4, 4, Some(4)));

        let second = sync.run_cycle().unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.cursor, Some(4));
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_empty_cache_is_noop() {
        let clock = Arc::new(ManualClock::new(100));
        let cache = Arc::new(TimeSeriesCache::new(50, clock.clone()));
        let store = Arc::new(SqlitePriceStore::open_memory().unwrap());
        let mut sync = DurableSync::new(cache, store, clock, Duration::from_secs(1));

        let report = sync.run_cycle().unwrap();
        assert_eq!(report, SyncReport { read: 0, inserted: 0, cursor: None });
    }

    #[test]
    fn test_cursor_uses_slowest_instrument() {
        let clock = Arc::new(ManualClock::new(10));
        let cache = Arc::new(TimeSeriesCache::new(1_000, clock.clone()));
        cache.append(PriceSample::new("fast", 9, 1)).unwrap();
        cache.append(PriceSample::new("slow", 3, 1)).unwrap();
        let store = Arc::new(SqlitePriceStore::open_memory().unwrap());
        let mut sync = DurableSync::new(cache.clone(), store.clone(), clock.clone(), Duration::from_secs(1));

        assert_eq!(sync.run_cycle().unwrap().cursor, Some(3));

        // A late sample for the slow instrument is still after the cursor
        cache.append(PriceSample::new("slow", 6, 2)).unwrap();
        let report = sync.run_cycle().unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.cursor, Some(6));
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_failed_write_keeps_cursor() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = scenario_cache(&clock);
        let store = Arc::new(BrokenStore {
            inner: SqlitePriceStore::open_memory().unwrap(),
            remaining: AtomicUsize::new(1),
            panic: false,
        });
        let mut sync = DurableSync::new(cache, store.clone(), clock, Duration::from_secs(1));

        assert!(sync.run_cycle().unwrap_err().is_transient());
        assert_eq!(sync.cursor(), None);

        let report = sync.run_cycle().unwrap();
        assert_eq!(report.inserted, 4);
        assert_eq!(store.inner.count().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_errors_and_panics() {
        for panic in [false, true] {
            let clock = Arc::new(ManualClock::new(0));
            let cache = scenario_cache(&clock);
            let store = Arc::new(BrokenStore {
                inner: SqlitePriceStore::open_memory().unwrap(),
                remaining: AtomicUsize::new(2),
                panic,
            });
            let sync = DurableSync::new(cache, store.clone(), clock, Duration::from_secs(60));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(sync.run(shutdown_rx));

            // Cycles at 0s, 60s, 120s; the third one succeeds
            tokio::time::sleep(Duration::from_secs(150)).await;
            let signalled = tokio::time::Instant::now();
            shutdown_tx.send(true).unwrap();
            let sync = handle.await.unwrap();
            // Shutdown cuts the pending 30s of sleep short
            assert!(signalled.elapsed() < Duration::from_secs(1));

            assert_eq!(sync.stats().failed_cycles.load(Ordering::Relaxed), 2);
            assert!(sync.stats().cycles.load(Ordering::Relaxed) >= 3);
            assert_eq!(store.inner.count().unwrap(), 4);
            assert_eq!(sync.cursor(), Some(4));
        }
    }
}
