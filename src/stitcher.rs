//! History/live stitching for readers.
//!
//! `merge` combines a prior series (durable snapshot or previous merge) with a
//! freshly fetched cache range into one sorted, duplicate-free view, plus the
//! newest timestamp per instrument for the next incremental fetch.
//!
//! `ReaderSession` drives the two reader entry points on top of it: a history
//! request that seeds the view from the durable store and the cache tail, and
//! an incremental poll that only asks the cache for data past each cursor.
//! Any change to the requested instrument set discards the view and reseeds.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::PriceCache;
use crate::clock::Clock;
use crate::error::PipelineError;
use crate::models::{flatten_series, group_by_instrument, PriceSample, SeriesMap, TimestampMs};
use crate::store::DurableStore;

/// Sorted, de-duplicated samples plus per-instrument cursors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedView {
    pub samples: Vec<PriceSample>,
    /// Newest timestamp present per instrument.
    pub cursors: BTreeMap<String, TimestampMs>,
}

impl MergedView {
    /// Build from samples already sorted by `(timestamp, instrument_id)` and
    /// free of duplicate keys.
    fn from_sorted(samples: Vec<PriceSample>) -> Self {
        let mut cursors = BTreeMap::new();
        for s in &samples {
            cursors
                .entry(s.instrument_id.clone())
                .and_modify(|ts: &mut TimestampMs| *ts = (*ts).max(s.timestamp))
                .or_insert(s.timestamp);
        }
        Self { samples, cursors }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-instrument series, for consumers that plot one line per instrument.
    pub fn series(&self) -> SeriesMap {
        group_by_instrument(&self.samples)
    }

    /// Drop samples older than `cutoff`, recomputing cursors.
    fn retain_from(self, cutoff: TimestampMs) -> Self {
        let samples = self
            .samples
            .into_iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect();
        Self::from_sorted(samples)
    }
}

/// Merge `prior` and `fresh` into one view.
///
/// Concatenates, stable-sorts by `(timestamp, instrument_id)` and keeps the
/// first occurrence of every `(instrument_id, timestamp)` key, so a prior
/// entry always wins over a colliding fresh one.
pub fn merge(prior: &[PriceSample], fresh: Vec<PriceSample>) -> MergedView {
    let mut all = Vec::with_capacity(prior.len() + fresh.len());
    all.extend_from_slice(prior);
    all.extend(fresh);

    all.sort_by(PriceSample::cmp_time_then_instrument);
    all.dedup_by(|current, previous| current.key() == previous.key());

    MergedView::from_sorted(all)
}

/// Sorted, de-duplicated instrument selection. Empty means every instrument.
fn normalize_selection(instruments: &[String]) -> Vec<String> {
    let mut selection: Vec<String> = instruments
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    selection.sort();
    selection.dedup();
    selection
}

/// One reader's stitching state.
pub struct ReaderSession {
    cache: Arc<dyn PriceCache>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    history_lookback_ms: i64,
    selection: Option<Vec<String>>,
    /// Explicit lower bound of the loaded history; `None` slides with `now`.
    window_from: Option<TimestampMs>,
    view: MergedView,
}

impl ReaderSession {
    pub fn new(
        cache: Arc<dyn PriceCache>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        history_lookback_ms: i64,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            history_lookback_ms,
            selection: None,
            window_from: None,
            view: MergedView::default(),
        }
    }

    pub fn selection(&self) -> Option<&[String]> {
        self.selection.as_deref()
    }

    pub fn view(&self) -> &MergedView {
        &self.view
    }

    /// Resolve optional bounds: `to` defaults to now, `from` to one lookback
    /// before `to`.
    pub fn history_window(
        &self,
        from_ts: Option<TimestampMs>,
        to_ts: Option<TimestampMs>,
    ) -> (TimestampMs, TimestampMs) {
        let to = to_ts.unwrap_or_else(|| self.clock.now_millis());
        let from = from_ts.unwrap_or(to - self.history_lookback_ms);
        (from, to)
    }

    /// Historical request: durable snapshot for `[from, to]` stitched with the
    /// cache tail. Bounds default as in `history_window`. Replaces any prior view.
    pub fn load_history(
        &mut self,
        instruments: &[String],
        from_ts: Option<TimestampMs>,
        to_ts: Option<TimestampMs>,
    ) -> Result<MergedView, PipelineError> {
        let selection = normalize_selection(instruments);
        let (from, to) = self.history_window(from_ts, to_ts);
        if from > to {
            return Err(PipelineError::DataShape(format!(
                "history range is inverted: {} > {}",
                from, to
            )));
        }

        let durable = MergedView::from_sorted(self.store.query(&selection, from, to)?);

        // Cache tail starts where the slowest instrument's durable data ends
        let tail_from = if selection.is_empty() {
            from
        } else {
            selection
                .iter()
                .map(|id| durable.cursors.get(id).copied().unwrap_or(from))
                .min()
                .unwrap_or(from)
                .max(from)
        };
        let tail = flatten_series(self.cache.range(&selection, tail_from, to)?);

        let view = merge(&durable.samples, tail);
        debug!(
            instruments = ?selection,
            from,
            to,
            durable = durable.len(),
            merged = view.len(),
            "Reader history loaded"
        );

        self.selection = Some(selection);
        self.window_from = from_ts;
        self.view = view.clone();
        Ok(view)
    }

    /// Incremental poll. Reseeds from history when the instrument set differs
    /// from the last request (or nothing was loaded yet).
    pub fn poll(&mut self, instruments: &[String]) -> Result<MergedView, PipelineError> {
        let selection = normalize_selection(instruments);
        if self.selection.as_ref() != Some(&selection) {
            debug!(
                previous = ?self.selection,
                requested = ?selection,
                "Instrument selection changed, reseeding"
            );
            return self.load_history(&selection, None, None);
        }

        let now = self.clock.now_millis();
        let default_from = now - self.history_lookback_ms;

        let fresh = if selection.is_empty() {
            let from = self
                .view
                .cursors
                .values()
                .copied()
                .min()
                .unwrap_or(default_from);
            flatten_series(self.cache.range(&[], from, now)?)
        } else {
            let mut fresh = Vec::new();
            for id in &selection {
                let from = self.view.cursors.get(id).copied().unwrap_or(default_from);
                let series = self.cache.range(std::slice::from_ref(id), from, now)?;
                fresh.extend(series.into_values().flatten());
            }
            fresh
        };

        let fetched = fresh.len();
        let mut view = merge(&self.view.samples, fresh);
        if self.window_from.is_none() {
            view = view.retain_from(default_from);
        }

        debug!(fetched, merged = view.len(), "Reader poll merged");
        self.view = view.clone();
        Ok(view)
    }
}
