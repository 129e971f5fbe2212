//! Large-Trade Aggregation
//!
//! Folds qualifying trades for one symbol into running statistics.
//!
//! - Retention: only the most recent `max_trades` qualifying trades are kept
//!   in full for `recent`.
//! - Window: `count` and the volume totals cover every qualifying trade no
//!   older than `window` relative to the newest trade seen, however many
//!   that is. Old trades decay out on every update.
//!
//! Totals are maintained incrementally from a compact per-trade record:
//! added on insert, subtracted when the trade decays out. The largest trade
//! is tracked through a short list of trades that can still be the maximum.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::{TakerSide, TradeEvent};
use super::symbol::Symbol;

/// A trade that met the size threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeTrade {
    /// Exchange trade id.
    pub trade_id: u64,
    /// Execution price.
    pub price: Decimal,
    /// Executed base quantity.
    pub quantity: Decimal,
    /// Quote-currency value.
    pub notional: Decimal,
    /// Aggressor side.
    pub side: TakerSide,
    /// Exchange trade time.
    pub time: DateTime<Utc>,
}

impl LargeTrade {
    /// Build from a trade event.
    #[must_use]
    pub fn from_trade(trade: &TradeEvent) -> Self {
        Self {
            trade_id: trade.trade_id,
            price: trade.price,
            quantity: trade.quantity,
            notional: trade.notional(),
            side: trade.taker_side,
            time: trade.trade_time,
        }
    }
}

/// Immutable copy of one symbol's large-trade statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeAggregate {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Qualifying trades currently in the window, including those no longer
    /// listed in `recent`.
    pub count: u64,
    /// Sum of buy-side notional in the window.
    pub buy_volume: Decimal,
    /// Sum of sell-side notional in the window.
    pub sell_volume: Decimal,
    /// Largest trade in the window.
    pub largest_trade: Option<LargeTrade>,
    /// Retained trades, newest first.
    pub recent: Vec<LargeTrade>,
}

impl TradeAggregate {
    /// Aggregate with no trades.
    #[must_use]
    pub const fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            count: 0,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            largest_trade: None,
            recent: Vec::new(),
        }
    }
}

/// Retention limits for one symbol's aggregate.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Maximum trades listed in `recent`.
    pub max_trades: usize,
    /// Trailing window for running totals.
    pub window: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_trades: 100,
            window: Duration::hours(1),
        }
    }
}

/// One trade's share of the running totals.
#[derive(Debug, Clone, Copy)]
struct Contribution {
    time: DateTime<Utc>,
    side: TakerSide,
    notional: Decimal,
}

/// Mutable windowed state for one symbol.
#[derive(Debug)]
pub struct TradeWindow {
    policy: RetentionPolicy,
    contributions: VecDeque<Contribution>,
    recent: VecDeque<LargeTrade>,
    candidates: Vec<LargeTrade>,
    buy_volume: Decimal,
    sell_volume: Decimal,
    newest: Option<DateTime<Utc>>,
}

impl TradeWindow {
    /// Create an empty window.
    #[must_use]
    pub const fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            contributions: VecDeque::new(),
            recent: VecDeque::new(),
            candidates: Vec::new(),
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            newest: None,
        }
    }

    /// Insert a qualifying trade and decay anything that fell out.
    ///
    /// Returns `false` if the trade is already older than the window and
    /// was not counted.
    pub fn insert(&mut self, trade: LargeTrade) -> bool {
        let newest = self.newest.map_or(trade.time, |t| t.max(trade.time));
        if trade.time < newest - self.policy.window {
            return false;
        }
        self.newest = Some(newest);

        match trade.side {
            TakerSide::Buy => self.buy_volume += trade.notional,
            TakerSide::Sell => self.sell_volume += trade.notional,
        }
        self.contributions.push_back(Contribution {
            time: trade.time,
            side: trade.side,
            notional: trade.notional,
        });

        // A candidate that is no larger and no newer can never be the
        // window's largest again.
        self.candidates
            .retain(|c| c.notional > trade.notional || c.time > trade.time);
        self.candidates.push(trade.clone());

        self.recent.push_back(trade);
        while self.recent.len() > self.policy.max_trades {
            self.recent.pop_front();
        }

        self.decay(newest);
        true
    }

    /// Number of qualifying trades in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    /// Whether the window holds no trades.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Copy out the current statistics.
    #[must_use]
    pub fn snapshot(&self, symbol: Symbol) -> TradeAggregate {
        TradeAggregate {
            symbol,
            count: self.contributions.len() as u64,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            largest_trade: self
                .candidates
                .iter()
                .max_by(|a, b| a.notional.cmp(&b.notional))
                .cloned(),
            recent: self.recent.iter().rev().cloned().collect(),
        }
    }

    fn decay(&mut self, newest: DateTime<Utc>) {
        let cutoff = newest - self.policy.window;
        // Trades can arrive slightly out of order, so scan rather than stop at
        // the first survivor.
        let (mut buy, mut sell) = (Decimal::ZERO, Decimal::ZERO);
        self.contributions.retain(|c| {
            if c.time >= cutoff {
                return true;
            }
            match c.side {
                TakerSide::Buy => buy += c.notional,
                TakerSide::Sell => sell += c.notional,
            }
            false
        });
        self.buy_volume -= buy;
        self.sell_volume -= sell;
        self.recent.retain(|t| t.time >= cutoff);
        self.candidates.retain(|t| t.time >= cutoff);
    }
}
