//! Durable History Inspection Tool
//!
//! Inspect what the sync job has written to the price store: per-instrument
//! coverage, raw rows for a window, and gaps larger than expected.
//!
//! Usage:
//!   cargo run --release --bin history_inspect -- --db ./pricestream.db summary
//!   cargo run --release --bin history_inspect -- --db ./pricestream.db range --instrument ticker_999 --last-minutes 5
//!   cargo run --release --bin history_inspect -- --db ./pricestream.db gaps --max-gap-ms 2000

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pricestream_backend::clock::{Clock, SystemClock, MILLIS_PER_MINUTE};
use pricestream_backend::models::{PriceSample, TimestampMs};
use pricestream_backend::store::{DurableStore, SqlitePriceStore};

#[derive(Parser, Debug)]
#[command(name = "history_inspect")]
#[command(about = "Inspect durably stored instrument prices")]
struct Cli {
    /// Path to the SQLite price store
    #[arg(long, env = "DB_PATH", default_value = "pricestream.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Row count and first/last timestamp per instrument
    Summary,

    /// Print stored rows for a time window
    Range {
        /// Instrument to show (all when omitted)
        #[arg(long)]
        instrument: Option<String>,

        /// Window start (ms since epoch)
        #[arg(long)]
        from: Option<i64>,

        /// Window end (ms since epoch)
        #[arg(long)]
        to: Option<i64>,

        /// Window size ending now, used when --from is omitted
        #[arg(long, default_value = "10")]
        last_minutes: i64,

        /// Maximum rows to print
        #[arg(long, default_value = "200")]
        limit: usize,
    },

    /// Report spans between consecutive rows longer than the threshold
    Gaps {
        #[arg(long)]
        instrument: Option<String>,

        #[arg(long, default_value = "2000")]
        max_gap_ms: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "history_inspect=info,pricestream_backend=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    if !cli.db.exists() {
        anyhow::bail!("price store not found: {}", cli.db.display());
    }
    let store = SqlitePriceStore::open(&cli.db)
        .with_context(|| format!("Failed to open {}", cli.db.display()))?;

    match cli.command {
        Commands::Summary => print_summary(&store)?,
        Commands::Range {
            instrument,
            from,
            to,
            last_minutes,
            limit,
        } => {
            let now = SystemClock.now_millis();
            let to = to.unwrap_or(now);
            let from = from.unwrap_or(to - last_minutes * MILLIS_PER_MINUTE);
            print_range(&store, instrument, from, to, limit)?;
        }
        Commands::Gaps {
            instrument,
            max_gap_ms,
        } => print_gaps(&store, instrument, max_gap_ms)?,
    }

    Ok(())
}

fn fmt_ts(ts: TimestampMs) -> String {
    Utc.timestamp_millis_opt(ts)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn selection(instrument: Option<String>, store: &SqlitePriceStore) -> Result<Vec<String>> {
    Ok(match instrument {
        Some(id) => vec![id],
        None => store.instruments()?,
    })
}

fn print_summary(store: &SqlitePriceStore) -> Result<()> {
    let instruments = store.instruments()?;
    println!("Total rows: {}", store.count()?);
    println!();
    println!("{:<20} {:>10}  {:<24} {:<24}", "instrument", "rows", "first", "last");

    for id in instruments {
        if let Some(cov) = store.coverage(&id)? {
            println!(
                "{:<20} {:>10}  {:<24} {:<24}",
                cov.instrument_id,
                cov.rows,
                fmt_ts(cov.first_ts),
                fmt_ts(cov.last_ts)
            );
        }
    }
    Ok(())
}

fn print_range(
    store: &SqlitePriceStore,
    instrument: Option<String>,
    from: TimestampMs,
    to: TimestampMs,
    limit: usize,
) -> Result<()> {
    let ids = instrument.into_iter().collect::<Vec<_>>();
    let rows = store.query(&ids, from, to)?;

    println!("{} rows in [{}, {}]", rows.len(), fmt_ts(from), fmt_ts(to));
    for row in rows.iter().take(limit) {
        println!("{}  {:<20} {:>8}", fmt_ts(row.timestamp), row.instrument_id, row.price);
    }
    if rows.len() > limit {
        println!("... {} more", rows.len() - limit);
    }
    Ok(())
}

fn print_gaps(store: &SqlitePriceStore, instrument: Option<String>, max_gap_ms: i64) -> Result<()> {
    let mut total = 0usize;
    for id in selection(instrument, store)? {
        let rows = store.query(std::slice::from_ref(&id), i64::MIN, i64::MAX)?;
        let gaps = find_gaps(&rows, max_gap_ms);
        total += gaps.len();
        for gap in gaps {
            println!(
                "{:<20} {} -> {}  ({} ms)",
                id,
                fmt_ts(gap.after),
                fmt_ts(gap.before),
                gap.before - gap.after
            );
        }
    }
    println!("{} gap(s) longer than {} ms", total, max_gap_ms);
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Gap {
    after: TimestampMs,
    before: TimestampMs,
}

/// Consecutive rows of one instrument further apart than `max_gap_ms`.
fn find_gaps(rows: &[PriceSample], max_gap_ms: i64) -> Vec<Gap> {
    rows.windows(2)
        .filter(|w| w[1].timestamp - w[0].timestamp > max_gap_ms)
        .map(|w| Gap {
            after: w[0].timestamp,
            before: w[1].timestamp,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_gaps() {
        let rows: Vec<_> = [1_000, 2_000, 3_000, 9_000, 10_000]
            .into_iter()
            .map(|t| PriceSample::new("X", t, 0))
            .collect();

        assert_eq!(find_gaps(&rows, 2_000), vec![Gap { after: 3_000, before: 9_000 }]);
        assert!(find_gaps(&rows, 10_000).is_empty());
        assert!(find_gaps(&rows[..1], 0).is_empty());
    }
}
