//! Large Trade Tracker
//!
//! Stateful multiplexer subscriber that folds trades at or above a
//! per-symbol notional threshold into a windowed [`TradeAggregate`].
//!
//! Each symbol's window has its own lock; the table lock is only taken to
//! look up or insert a window. Readers always get a copy.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use super::multiplexer::{ChannelMessage, StreamMultiplexer, SubscriptionHandle, callback};
use crate::domain::aggregation::{LargeTrade, RetentionPolicy, TradeAggregate, TradeWindow};
use crate::domain::channel::{ChannelKey, ConnectionState};
use crate::domain::market::{MarketEvent, TradeEvent};
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;
use crate::infrastructure::metrics;

/// Thresholds and retention for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Notional threshold for symbols without an override.
    pub default_threshold: Decimal,
    /// Per-symbol notional thresholds.
    pub thresholds: HashMap<Symbol, Decimal>,
    /// Per-symbol retention.
    pub retention: RetentionPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_threshold: Decimal::from(100_000),
            thresholds: HashMap::new(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Large ("whale") trade detector.
pub struct LargeTradeTracker {
    config: TrackerConfig,
    provider: Provider,
    multiplexer: StreamMultiplexer,
    table: RwLock<HashMap<Symbol, Arc<Mutex<TradeWindow>>>>,
    handles: Mutex<HashMap<Symbol, SubscriptionHandle>>,
}

impl std::fmt::Debug for LargeTradeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeTradeTracker")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LargeTradeTracker {
    /// Create a tracker and subscribe to the trade channel of every symbol.
    ///
    /// # Errors
    ///
    /// Returns the first subscription error. Symbols subscribed before the
    /// failure are released again.
    pub fn start(
        config: TrackerConfig,
        multiplexer: StreamMultiplexer,
        provider: Provider,
        symbols: impl IntoIterator<Item = Symbol>,
    ) -> Result<Arc<Self>, MarketDataError> {
        let tracker = Arc::new(Self {
            config,
            provider,
            multiplexer,
            table: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        });
        for symbol in symbols {
            if let Err(e) = tracker.track(symbol) {
                tracker.stop();
                return Err(e);
            }
        }
        Ok(tracker)
    }

    /// Start tracking a symbol. No-op if it is already tracked, unless its
    /// trade channel was rejected upstream, in which case the subscription
    /// is renewed so the channel reconnects.
    ///
    /// # Errors
    ///
    /// Returns the multiplexer's subscribe error. A held subscription is kept
    /// when renewing it fails.
    pub fn track(self: &Arc<Self>, symbol: Symbol) -> Result<(), MarketDataError> {
        let mut handles = self.handles.lock();
        if let Some(held) = handles.get(&symbol) {
            if self.multiplexer.connection_state(held.key()) != Some(ConnectionState::Failed) {
                return Ok(());
            }
            tracing::info!(symbol = %symbol, "Trade channel failed, resubscribing");
        }

        let tracker: Weak<Self> = Arc::downgrade(self);
        let key = ChannelKey::trades(self.provider, symbol.clone());
        let handle = self.multiplexer.subscribe(
            key,
            callback(move |message| {
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                match message {
                    ChannelMessage::Event(event) => {
                        if let MarketEvent::Trade(trade) = event.as_ref() {
                            tracker.record_trade(trade);
                        }
                    }
                    ChannelMessage::Error(e) => {
                        tracing::error!(error = %e, "Trade channel failed, paused until tracked again");
                    }
                }
            }),
        )?;

        self.window(&symbol);
        tracing::info!(
            symbol = %symbol,
            threshold = %self.threshold(&symbol),
            "Tracking large trades"
        );
        if let Some(previous) = handles.insert(symbol, handle) {
            self.multiplexer.unsubscribe(&previous);
        }
        Ok(())
    }

    /// Whether a symbol is tracked.
    #[must_use]
    pub fn is_tracking(&self, symbol: &Symbol) -> bool {
        self.handles.lock().contains_key(symbol)
    }

    /// Notional threshold for a symbol.
    #[must_use]
    pub fn threshold(&self, symbol: &Symbol) -> Decimal {
        self.config
            .thresholds
            .get(symbol)
            .copied()
            .unwrap_or(self.config.default_threshold)
    }

    /// Fold one trade. Returns the recorded trade if it qualified.
    ///
    /// The threshold is inclusive.
    pub fn record_trade(&self, trade: &TradeEvent) -> Option<LargeTrade> {
        let threshold = self.threshold(&trade.symbol);
        if trade.notional() < threshold {
            return None;
        }

        let large = LargeTrade::from_trade(trade);
        let window = self.window(&trade.symbol);
        if !window.lock().insert(large.clone()) {
            tracing::debug!(
                symbol = %trade.symbol,
                trade_id = trade.trade_id,
                "Large trade older than retention window, ignored"
            );
            return None;
        }

        metrics::record_large_trade(large.side);
        tracing::info!(
            symbol = %trade.symbol,
            side = ?large.side,
            price = %large.price,
            quantity = %large.quantity,
            notional = %large.notional,
            "Large trade detected"
        );
        Some(large)
    }

    /// Copy of a symbol's aggregate. Untracked symbols yield an empty one.
    #[must_use]
    pub fn snapshot(&self, symbol: &Symbol) -> TradeAggregate {
        let window = self.table.read().get(symbol).cloned();
        window.map_or_else(
            || TradeAggregate::empty(symbol.clone()),
            |window| window.lock().snapshot(symbol.clone()),
        )
    }

    /// Release every trade subscription.
    pub fn stop(&self) {
        let handles: Vec<SubscriptionHandle> =
            self.handles.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            self.multiplexer.unsubscribe(handle);
        }
        if !handles.is_empty() {
            tracing::info!(symbols = handles.len(), "Large trade tracker stopped");
        }
    }

    fn window(&self, symbol: &Symbol) -> Arc<Mutex<TradeWindow>> {
        if let Some(window) = self.table.read().get(symbol) {
            return Arc::clone(window);
        }
        Arc::clone(
            self.table
                .write()
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(Mutex::new(TradeWindow::new(self.config.retention)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use test_case::test_case;

    use super::*;
    use crate::application::services::multiplexer::MultiplexerConfig;
    use crate::domain::market::TakerSide;
    use crate::infrastructure::binance::BinanceStreamProvider;
    use crate::infrastructure::websocket::MemoryTransport;

    fn btc() -> Symbol {
        Symbol::parse("BTC-USDT").unwrap()
    }

    fn trade(id: u64, notional: i64, side: TakerSide) -> TradeEvent {
        TradeEvent {
            symbol: btc(),
            trade_id: id,
            price: Decimal::from(notional),
            quantity: Decimal::ONE,
            taker_side: side,
            trade_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(i64::try_from(id).unwrap()),
        }
    }

    fn tracker(transport: &MemoryTransport) -> Arc<LargeTradeTracker> {
        let mux = StreamMultiplexer::new(
            vec![Arc::new(BinanceStreamProvider::default())],
            Arc::new(transport.clone()),
            MultiplexerConfig::default(),
        );
        LargeTradeTracker::start(TrackerConfig::default(), mux, Provider::Binance, [btc()]).unwrap()
    }

    #[test_case(99_999, false ; "below threshold")]
    #[test_case(100_000, true ; "at threshold")]
    #[test_case(100_001, true ; "above threshold")]
    #[tokio::test]
    async fn threshold_is_inclusive(notional: i64, qualifies: bool) {
        let transport = MemoryTransport::new();
        let tracker = tracker(&transport);

        assert_eq!(
            tracker.record_trade(&trade(1, notional, TakerSide::Buy)).is_some(),
            qualifies
        );
        assert_eq!(tracker.snapshot(&btc()).count, u64::from(qualifies));
    }

    #[tokio::test]
    async fn counts_only_qualifying_trades() {
        let transport = MemoryTransport::new();
        let tracker = tracker(&transport);

        let notionals = [10_000, 250_000, 99_000, 100_000, 5_000, 400_000];
        for (id, notional) in notionals.into_iter().enumerate() {
            tracker.record_trade(&trade(id as u64, notional, TakerSide::Sell));
        }

        let snapshot = tracker.snapshot(&btc());
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.sell_volume, Decimal::from(750_000));
        assert_eq!(
            snapshot.largest_trade.map(|t| t.notional),
            Some(Decimal::from(400_000))
        );
    }

    #[tokio::test]
    async fn per_symbol_threshold_overrides_default() {
        let transport = MemoryTransport::new();
        let mux = StreamMultiplexer::new(
            vec![Arc::new(BinanceStreamProvider::default())],
            Arc::new(transport.clone()),
            MultiplexerConfig::default(),
        );
        let config = TrackerConfig {
            thresholds: HashMap::from([(btc(), Decimal::from(500_000))]),
            ..TrackerConfig::default()
        };
        let tracker = LargeTradeTracker::start(config, mux, Provider::Binance, []).unwrap();

        assert_eq!(tracker.threshold(&btc()), Decimal::from(500_000));
        assert!(tracker.record_trade(&trade(1, 200_000, TakerSide::Buy)).is_none());
    }

    #[tokio::test]
    async fn snapshot_of_untracked_symbol_is_empty() {
        let transport = MemoryTransport::new();
        let tracker = tracker(&transport);
        let eth = Symbol::parse("ETH-USDT").unwrap();

        let snapshot = tracker.snapshot(&eth);
        assert_eq!(snapshot.symbol, eth);
        assert_eq!(snapshot.count, 0);
        assert!(snapshot.largest_trade.is_none());
    }

    #[tokio::test]
    async fn track_is_idempotent_and_stop_releases() {
        let transport = MemoryTransport::new();
        let tracker = tracker(&transport);

        tracker.track(btc()).unwrap();
        assert!(tracker.is_tracking(&btc()));

        tracker.stop();
        assert!(!tracker.is_tracking(&btc()));
    }
}
