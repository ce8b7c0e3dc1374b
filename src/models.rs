//! Shared data shapes for the price pipeline.
//!
//! A `PriceSeries` is simply instrument → ordered samples. Nothing here has
//! behaviour beyond grouping and ordering helpers; every stage operates on
//! these types.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Milliseconds since Unix epoch.
pub type TimestampMs = i64;

/// Instrument → samples sorted by timestamp ascending.
pub type SeriesMap = BTreeMap<String, Vec<PriceSample>>;

/// Label value every generated series carries under `type`.
pub const TRADING_INSTRUMENTS_TYPE: &str = "trading_instruments";

/// One generated price point. Immutable once created; identified by
/// `(instrument_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceSample {
    pub instrument_id: String,
    pub timestamp: TimestampMs,
    pub price: i64,
}

impl PriceSample {
    pub fn new(instrument_id: impl Into<String>, timestamp: TimestampMs, price: i64) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            timestamp,
            price,
        }
    }

    /// De-duplication key, matching the durable primary key.
    #[inline]
    pub fn key(&self) -> (&str, TimestampMs) {
        (self.instrument_id.as_str(), self.timestamp)
    }

    /// Payload published to live listeners.
    pub fn to_tick(&self) -> PriceTick {
        PriceTick {
            time: self.timestamp,
            value: self.price,
        }
    }

    /// Ordering used for merged views: timestamp first, then instrument.
    pub fn cmp_time_then_instrument(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.instrument_id.cmp(&other.instrument_id))
    }
}

/// Live notification payload: `{"time": <ms>, "value": <price>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub time: TimestampMs,
    pub value: i64,
}

/// A configured trading instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub name: String,
}

impl Instrument {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Flatten a series map into one sequence sorted by `(timestamp, instrument_id)`.
pub fn flatten_series(series: SeriesMap) -> Vec<PriceSample> {
    let mut samples: Vec<PriceSample> = series.into_values().flatten().collect();
    samples.sort_by(PriceSample::cmp_time_then_instrument);
    samples
}

/// Group samples by instrument, keeping each group in timestamp order.
pub fn group_by_instrument(samples: &[PriceSample]) -> SeriesMap {
    let mut series = SeriesMap::new();
    for sample in samples {
        series
            .entry(sample.instrument_id.clone())
            .or_default()
            .push(sample.clone());
    }
    for points in series.values_mut() {
        points.sort_by_key(|s| s.timestamp);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_payload_shape() {
        let sample = PriceSample::new("ticker_999", 1_700_000_000_000, -3);
        let json = serde_json::to_string(&sample.to_tick()).unwrap();
        assert_eq!(json, r#"{"time":1700000000000,"value":-3}"#);
    }

    #[test]
    fn test_flatten_orders_by_time_then_instrument() {
        let mut series = SeriesMap::new();
        series.insert(
            "b".to_string(),
            vec![PriceSample::new("b", 1, 10), PriceSample::new("b", 3, 11)],
        );
        series.insert(
            "a".to_string(),
            vec![PriceSample::new("a", 1, 20), PriceSample::new("a", 2, 21)],
        );

        let flat = flatten_series(series);
        let keys: Vec<_> = flat.iter().map(|s| (s.instrument_id.as_str(), s.timestamp)).collect();
        assert_eq!(keys, vec![("a", 1), ("b", 1), ("a", 2), ("b", 3)]);
    }

    #[test]
    fn test_group_by_instrument() {
        let samples = vec![
            PriceSample::new("x", 2, 1),
            PriceSample::new("y", 1, 5),
            PriceSample::new("x", 1, 0),
        ];
        let grouped = group_by_instrument(&samples);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["x"][0].timestamp, 1);
        assert_eq!(grouped["x"][1].timestamp, 2);
    }
}
