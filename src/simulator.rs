//! Price simulator.
//!
//! One independent loop per instrument: step a symmetric ±1 random walk,
//! append the sample to the cache, publish it to live listeners, then sleep
//! out the rest of the tick period. A failing tick is logged and skipped; it
//! never stops the loop, and loops for different instruments share nothing
//! but the cache and the notifier.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{AppendOutcome, PriceCache};
use crate::clock::Clock;
use crate::error::{panic_reason, PipelineError};
use crate::models::PriceSample;
use crate::notify::PriceNotifier;

/// Source of walk steps. Every step must be `-1` or `+1`.
pub trait MoveSource: Send {
    fn next_move(&mut self) -> i64;
}

/// Uniform ±1 steps.
pub struct RandomMoves {
    rng: ChaCha8Rng,
}

impl RandomMoves {
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl MoveSource for RandomMoves {
    #[inline]
    fn next_move(&mut self) -> i64 {
        if self.rng.gen_bool(0.5) {
            1
        } else {
            -1
        }
    }
}

/// Replays a fixed step sequence, cycling when exhausted.
pub struct ScriptedMoves {
    steps: VecDeque<i64>,
}

impl ScriptedMoves {
    /// Non-unit steps are clamped to ±1. An empty script walks upward.
    pub fn new(steps: impl IntoIterator<Item = i64>) -> Self {
        let mut steps: VecDeque<i64> = steps
            .into_iter()
            .map(i64::signum)
            .filter(|s| *s != 0)
            .collect();
        if steps.is_empty() {
            steps.push_back(1);
        }
        Self { steps }
    }
}

impl MoveSource for ScriptedMoves {
    fn next_move(&mut self) -> i64 {
        let step = self.steps.pop_front().unwrap_or(1);
        self.steps.push_back(step);
        step
    }
}

/// Running price state for one instrument. Starts at 0, unbounded both ways.
pub struct InstrumentWalk {
    instrument: String,
    price: i64,
    steps: u64,
    moves: Box<dyn MoveSource>,
}

impl InstrumentWalk {
    pub fn new(instrument: impl Into<String>, moves: Box<dyn MoveSource>) -> Self {
        Self {
            instrument: instrument.into(),
            price: 0,
            steps: 0,
            moves,
        }
    }

    pub fn random(instrument: impl Into<String>) -> Self {
        Self::new(instrument, Box::new(RandomMoves::from_entropy()))
    }

    /// Apply one step and return the new price.
    pub fn advance(&mut self) -> i64 {
        self.price += self.moves.next_move();
        self.steps += 1;
        self.price
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn price(&self) -> i64 {
        self.price
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

/// Time left in the tick after `elapsed` of processing; zero when overrun.
#[inline]
pub fn remaining_tick(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

#[derive(Debug, Default)]
pub struct SimulatorStats {
    pub ticks: AtomicU64,
    pub failures: AtomicU64,
    pub published: AtomicU64,
}

pub struct PriceSimulator {
    cache: Arc<dyn PriceCache>,
    notifier: Arc<PriceNotifier>,
    clock: Arc<dyn Clock>,
    tick_period: Duration,
    stats: SimulatorStats,
}

impl PriceSimulator {
    pub fn new(
        cache: Arc<dyn PriceCache>,
        notifier: Arc<PriceNotifier>,
        clock: Arc<dyn Clock>,
        tick_period: Duration,
    ) -> Self {
        Self {
            cache,
            notifier,
            clock,
            tick_period,
            stats: SimulatorStats::default(),
        }
    }

    /// Produce, store and publish one sample.
    pub fn tick(&self, walk: &mut InstrumentWalk) -> Result<PriceSample, PipelineError> {
        let price = walk.advance();
        let sample = PriceSample::new(walk.instrument.clone(), self.clock.now_millis(), price);

        match self.cache.append(sample.clone())? {
            AppendOutcome::Appended => {}
            AppendOutcome::Duplicate => {
                warn!(
                    instrument = %sample.instrument_id,
                    ts = sample.timestamp,
                    "Duplicate tick timestamp, first sample kept"
                );
            }
            AppendOutcome::Expired => {
                warn!(
                    instrument = %sample.instrument_id,
                    ts = sample.timestamp,
                    "Tick already outside retention window"
                );
            }
        }

        let receivers = self.notifier.publish(&sample.instrument_id, sample.to_tick());
        self.stats
            .published
            .fetch_add(receivers as u64, Ordering::Relaxed);
        Ok(sample)
    }

    /// Run one instrument's loop until shutdown is signalled.
    pub async fn generate(
        self: Arc<Self>,
        mut walk: InstrumentWalk,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            instrument = %walk.instrument,
            period_ms = self.tick_period.as_millis() as u64,
            "Price generator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            match catch_unwind(AssertUnwindSafe(|| self.tick(&mut walk))) {
                Ok(Ok(sample)) => {
                    self.stats.ticks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        instrument = %sample.instrument_id,
                        ts = sample.timestamp,
                        price = sample.price,
                        "Generated price"
                    );
                }
                Ok(Err(e)) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(instrument = %walk.instrument, error = %e, "Price tick failed");
                }
                Err(panic) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        instrument = %walk.instrument,
                        reason = %panic_reason(panic.as_ref()),
                        "Price tick panicked"
                    );
                }
            }

            let sleep_for = remaining_tick(self.tick_period, started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            instrument = %walk.instrument,
            steps = walk.steps(),
            price = walk.price(),
            "Price generator stopped"
        );
    }

    /// Spawn one supervised loop per walk.
    pub fn spawn_all(
        self: &Arc<Self>,
        walks: Vec<InstrumentWalk>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for walk in walks {
            tasks.spawn(self.clone().generate(walk, shutdown.clone()));
        }
        tasks
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }
}
