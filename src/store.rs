//! Durable price storage (SQLite)
//!
//! One table keyed by `(instrument_id, created_at)`. The pipeline only ever
//! inserts; a conflicting insert is a silent no-op, so repeated or overlapping
//! sync cycles are harmless.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{PriceSample, TimestampMs};

const PRICES_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trading_prices (
    instrument_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,  -- ms since epoch
    price INTEGER NOT NULL,
    PRIMARY KEY (instrument_id, created_at)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trading_prices_created_at
    ON trading_prices(created_at, instrument_id);
"#;

/// Insert-or-ignore sink plus the range query readers reseed from.
pub trait DurableStore: Send + Sync {
    /// Insert every sample, ignoring keys that already exist. All-or-nothing.
    /// Returns the number of rows actually inserted.
    fn insert_ignore(&self, samples: &[PriceSample]) -> Result<usize, PipelineError>;

    /// Rows with `from_ts <= created_at <= to_ts`, ordered by
    /// `(created_at, instrument_id)`. Empty `instruments` selects all.
    fn query(
        &self,
        instruments: &[String],
        from_ts: TimestampMs,
        to_ts: TimestampMs,
    ) -> Result<Vec<PriceSample>, PipelineError>;
}

/// Stored span of one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub instrument_id: String,
    pub first_ts: TimestampMs,
    pub last_ts: TimestampMs,
    pub rows: u64,
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub inserted: AtomicU64,
    pub ignored: AtomicU64,
}

pub struct SqlitePriceStore {
    conn: Arc<Mutex<Connection>>,
    stats: StoreStats,
}

impl SqlitePriceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            PipelineError::store(format!("cannot open {}: {}", path.display(), e))
        })?;
        conn.execute_batch(PRICES_SCHEMA)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM trading_prices", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %path.display(), rows, "Price store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            stats: StoreStats::default(),
        })
    }

    pub fn open_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(PRICES_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            stats: StoreStats::default(),
        })
    }

    pub fn count(&self) -> Result<u64, PipelineError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM trading_prices", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// First/last stored timestamp and row count for an instrument.
    pub fn coverage(&self, instrument: &str) -> Result<Option<Coverage>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT MIN(created_at), MAX(created_at), COUNT(*)
             FROM trading_prices WHERE instrument_id = ?1",
        )?;
        let (first, last, rows): (Option<i64>, Option<i64>, i64) =
            stmt.query_row(params![instrument], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        Ok(match (first, last) {
            (Some(first_ts), Some(last_ts)) => Some(Coverage {
                instrument_id: instrument.to_string(),
                first_ts,
                last_ts,
                rows: rows as u64,
            }),
            _ => None,
        })
    }

    /// Instruments with at least one stored row, sorted.
    pub fn instruments(&self) -> Result<Vec<String>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT instrument_id FROM trading_prices ORDER BY instrument_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

impl DurableStore for SqlitePriceStore {
    fn insert_ignore(&self, samples: &[PriceSample]) -> Result<usize, PipelineError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO trading_prices (instrument_id, created_at, price)
                 VALUES (?1, ?2, ?3)",
            )?;
            for sample in samples {
                inserted += stmt.execute(params![
                    &sample.instrument_id,
                    sample.timestamp,
                    sample.price
                ])?;
            }
        }
        tx.commit()?;

        self.stats
            .inserted
            .fetch_add(inserted as u64, Ordering::Relaxed);
        self.stats
            .ignored
            .fetch_add((samples.len() - inserted) as u64, Ordering::Relaxed);
        debug!(offered = samples.len(), inserted, "Price batch stored");
        Ok(inserted)
    }

    fn query(
        &self,
        instruments: &[String],
        from_ts: TimestampMs,
        to_ts: TimestampMs,
    ) -> Result<Vec<PriceSample>, PipelineError> {
        if from_ts > to_ts {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT instrument_id, created_at, price FROM trading_prices
             WHERE created_at >= ?1 AND created_at <= ?2",
        );
        let mut args: Vec<Value> = vec![Value::Integer(from_ts), Value::Integer(to_ts)];
        if !instruments.is_empty() {
            let placeholders: Vec<String> =
                (0..instruments.len()).map(|i| format!("?{}", i + 3)).collect();
            sql.push_str(&format!(" AND instrument_id IN ({})", placeholders.join(", ")));
            args.extend(instruments.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY created_at, instrument_id");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(PriceSample {
                    instrument_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    price: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
