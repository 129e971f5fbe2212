//! Latest Price Book
//!
//! Folds ticker events into the most recent [`PriceSnapshot`] per symbol.
//! Snapshots older than the freshness bound are still returned, tagged
//! `stale`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;

use crate::application::ports::Clock;
use crate::domain::market::{MarketEvent, PriceSnapshot};
use crate::domain::symbol::Symbol;

/// Latest ticker snapshot per symbol.
pub struct PriceBook {
    prices: RwLock<HashMap<Symbol, PriceSnapshot>>,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PriceBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceBook")
            .field("symbols", &self.prices.read().len())
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl PriceBook {
    /// Create an empty book.
    #[must_use]
    pub fn new(stale_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            stale_after,
            clock,
        }
    }

    /// Apply a market event. Only ticker events change the book.
    pub fn apply(&self, event: &MarketEvent) {
        let MarketEvent::Ticker(ticker) = event else {
            return;
        };
        let snapshot = PriceSnapshot {
            symbol: ticker.symbol.clone(),
            last_price: ticker.last_price,
            change_percent_24h: ticker.change_percent_24h,
            best_bid: ticker.best_bid,
            best_ask: ticker.best_ask,
            event_time: ticker.event_time,
            received_at: self.clock.now(),
            stale: false,
        };

        let mut prices = self.prices.write();
        let newer = prices
            .get(&ticker.symbol)
            .is_none_or(|current| current.event_time <= snapshot.event_time);
        if newer {
            prices.insert(ticker.symbol.clone(), snapshot);
        }
    }

    /// Most recent snapshot for a symbol, if any.
    #[must_use]
    pub fn latest(&self, symbol: &Symbol) -> Option<PriceSnapshot> {
        let mut snapshot = self.prices.read().get(symbol).cloned()?;
        snapshot.stale = self.clock.now() - snapshot.received_at > self.stale_after;
        Some(snapshot)
    }
}
