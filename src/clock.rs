//! Pipeline Clock
//!
//! Single source of "now" for sample timestamps, retention and cursors.
//! Components receive an `Arc<dyn Clock>` instead of reading system time, so
//! retention and stitching behaviour can be driven deterministically.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::models::TimestampMs;

/// Conversion constants
pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SEC;

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since Unix epoch.
    fn now_millis(&self) -> TimestampMs;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_millis(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock.
///
/// Never moves on its own; `advance` and `set` are the only way time passes.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimestampMs) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: TimestampMs) {
        self.current.store(now, Ordering::SeqCst);
    }

    /// Advance by `delta_ms` and return the new time.
    pub fn advance(&self, delta_ms: i64) -> TimestampMs {
        self.current.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> TimestampMs {
        self.current.load(Ordering::SeqCst)
    }
}
