//! Per-instrument live price notifications.
//!
//! Fire-and-forget publish/subscribe keyed by instrument name. Publishing
//! with nobody listening is not an error; the tick is simply dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::PriceTick;

pub struct PriceNotifier {
    channels: RwLock<HashMap<String, broadcast::Sender<PriceTick>>>,
    capacity: usize,
}

impl PriceNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to ticks for one instrument. The channel is created on demand,
    /// so subscribing before the generator starts is fine.
    pub fn subscribe(&self, instrument: &str) -> broadcast::Receiver<PriceTick> {
        if let Some(tx) = self.channels.read().get(instrument) {
            return tx.subscribe();
        }
        self.channels
            .write()
            .entry(instrument.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a tick. Returns how many receivers got it (0 when nobody listens).
    pub fn publish(&self, instrument: &str, tick: PriceTick) -> usize {
        let channels = self.channels.read();
        let Some(tx) = channels.get(instrument) else {
            trace!(instrument = %instrument, "no listeners for instrument");
            return 0;
        };
        match tx.send(tick) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(instrument = %instrument, "no active price receivers");
                0
            }
        }
    }

    pub fn subscriber_count(&self, instrument: &str) -> usize {
        self.channels
            .read()
            .get(instrument)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
