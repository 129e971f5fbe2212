//! Large-Trade Tracking Integration Tests
//!
//! Feeds Binance trade frames through the hub and checks the per-symbol
//! aggregates exposed by the facade.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::time::timeout;

use market_data_hub::application::ports::{InMemoryLedgerStore, SystemClock};
use market_data_hub::application::services::{
    LargeTradeTracker, MultiplexerConfig, TrackerConfig,
};
use market_data_hub::domain::aggregation::RetentionPolicy;
use market_data_hub::infrastructure::binance::BinanceStreamProvider;
use market_data_hub::infrastructure::websocket::MemoryTransport;
use market_data_hub::{
    ConnectionState, DataFacade, HubDependencies, HubSettings, MarketDataHub, Provider,
    StreamMultiplexer, Symbol, TakerSide, TradeAggregate, TradeEvent,
};

const WAIT: Duration = Duration::from_secs(2);

fn btc() -> Symbol {
    Symbol::parse("BTC-USDT").unwrap()
}

fn trade_frame(native: &str, trade_id: u64, price: &str, qty: &str, buyer_is_maker: bool) -> String {
    let now = Utc::now().timestamp_millis();
    format!(
        r#"{{"e":"trade","E":{now},"s":"{native}","t":{trade_id},"p":"{price}","q":"{qty}","T":{now},"m":{buyer_is_maker},"M":true}}"#
    )
}

async fn hub(transport: &MemoryTransport, tracker: TrackerConfig) -> MarketDataHub {
    let settings = HubSettings {
        tracker,
        watch_symbols: vec![btc()],
        ..HubSettings::default()
    };
    let deps = HubDependencies {
        stream_providers: vec![Arc::new(BinanceStreamProvider::default())],
        transport: Arc::new(transport.clone()),
        rest_providers: Vec::new(),
        ledger_store: Arc::new(InMemoryLedgerStore::new()),
        clock: Arc::new(SystemClock),
    };
    MarketDataHub::init(settings, deps).await.unwrap()
}

async fn wait_for_count(facade: &DataFacade, symbol: &Symbol, count: u64) -> TradeAggregate {
    timeout(WAIT, async {
        loop {
            let aggregate = facade.large_trades(symbol).unwrap();
            if aggregate.count >= count {
                return aggregate;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

async fn wait_for_state(facade: &DataFacade, state: ConnectionState) {
    timeout(WAIT, async {
        while !facade.channel_states().iter().any(|status| status.state == state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn only_trades_at_or_above_threshold_are_counted() {
    let transport = MemoryTransport::new();
    let hub = hub(&transport, TrackerConfig::default()).await;
    let facade = hub.facade();
    assert!(transport.wait_for_session("btcusdt@trade", WAIT).await);

    // 50k buy, 150k sell, 200k buy.
    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 1, "50000", "1", false));
    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 2, "75000", "2", true));
    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 3, "100000", "2", false));

    let aggregate = wait_for_count(&facade, &btc(), 2).await;

    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.buy_volume, Decimal::from(200_000));
    assert_eq!(aggregate.sell_volume, Decimal::from(150_000));
    let largest = aggregate.largest_trade.unwrap();
    assert_eq!(largest.notional, Decimal::from(200_000));
    assert_eq!(largest.side, TakerSide::Buy);
    assert_eq!(aggregate.recent.len(), 2);
    assert_eq!(aggregate.recent[0].trade_id, 3);

    hub.shutdown().await;
}

#[tokio::test]
async fn per_symbol_threshold_overrides_default() {
    let transport = MemoryTransport::new();
    let tracker = TrackerConfig {
        thresholds: HashMap::from([(btc(), Decimal::from(1_000))]),
        ..TrackerConfig::default()
    };
    let hub = hub(&transport, tracker).await;
    let facade = hub.facade();
    assert!(transport.wait_for_session("btcusdt@trade", WAIT).await);

    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 1, "999", "1", false));
    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 2, "1000", "1", true));

    let aggregate = wait_for_count(&facade, &btc(), 1).await;
    assert_eq!(aggregate.count, 1);
    assert_eq!(aggregate.sell_volume, Decimal::from(1_000));

    hub.shutdown().await;
}

#[tokio::test]
async fn first_query_starts_tracking_an_unwatched_symbol() {
    let transport = MemoryTransport::new();
    let hub = hub(&transport, TrackerConfig::default()).await;
    let facade = hub.facade();
    let eth = Symbol::parse("ETH-USDT").unwrap();

    assert!(!facade.tracker().is_tracking(&eth));
    let empty = facade.large_trades(&eth).unwrap();
    assert_eq!(empty.count, 0);
    assert!(empty.largest_trade.is_none());
    assert!(facade.tracker().is_tracking(&eth));

    assert!(transport.wait_for_session("ethusdt@trade", WAIT).await);
    transport.push_text_matching("ethusdt@trade", &trade_frame("ETHUSDT", 5, "4000", "30", false));

    let aggregate = wait_for_count(&facade, &eth, 1).await;
    assert_eq!(aggregate.buy_volume, Decimal::from(120_000));

    hub.shutdown().await;
}

#[tokio::test]
async fn unsupported_symbol_is_rejected() {
    let transport = MemoryTransport::new();
    let hub = hub(&transport, TrackerConfig::default()).await;

    let result = hub.facade().large_trades(&Symbol::parse("BTC-XYZ").unwrap());

    assert!(matches!(
        result,
        Err(market_data_hub::MarketDataError::UnsupportedSymbol { .. })
    ));
    hub.shutdown().await;
}

#[tokio::test]
async fn query_after_rejection_resubscribes_the_trade_channel() {
    let transport = MemoryTransport::new();
    let hub = hub(&transport, TrackerConfig::default()).await;
    let facade = hub.facade();
    assert!(transport.wait_for_session("btcusdt@trade", WAIT).await);
    let connects = transport.connect_count();

    transport.push_text_matching(
        "btcusdt@trade",
        r#"{"error":{"code":2,"msg":"Invalid request: unknown stream"},"id":1}"#,
    );
    wait_for_state(&facade, ConnectionState::Failed).await;
    assert!(facade.tracker().is_tracking(&btc()));

    facade.large_trades(&btc()).unwrap();

    wait_for_state(&facade, ConnectionState::Connected).await;
    assert_eq!(transport.connect_count(), connects + 1);
    transport.push_text_matching("btcusdt@trade", &trade_frame("BTCUSDT", 7, "100000", "1", false));
    let aggregate = wait_for_count(&facade, &btc(), 1).await;
    assert_eq!(aggregate.buy_volume, Decimal::from(100_000));

    // A healthy channel is left alone.
    facade.large_trades(&btc()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connect_count(), connects + 1);

    hub.shutdown().await;
}

#[tokio::test]
async fn window_and_retention_bound_the_aggregate() {
    let mux = StreamMultiplexer::new(
        vec![Arc::new(BinanceStreamProvider::default())],
        Arc::new(MemoryTransport::new()),
        MultiplexerConfig::default(),
    );
    let tracker = LargeTradeTracker::start(
        TrackerConfig {
            default_threshold: Decimal::from(100),
            thresholds: HashMap::new(),
            retention: RetentionPolicy {
                max_trades: 3,
                window: chrono::Duration::minutes(10),
            },
        },
        mux.clone(),
        Provider::Binance,
        [],
    )
    .unwrap();
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    let trade = |id: u64, notional: i64, minutes: i64| TradeEvent {
        symbol: btc(),
        trade_id: id,
        price: Decimal::from(notional),
        quantity: Decimal::ONE,
        taker_side: TakerSide::Buy,
        trade_time: start + chrono::Duration::minutes(minutes),
    };

    assert!(tracker.record_trade(&trade(1, 5_000, 0)).is_some());
    assert!(tracker.record_trade(&trade(2, 200, 1)).is_some());
    assert!(tracker.record_trade(&trade(3, 99, 2)).is_none());

    // The 5k trade falls out of the window; the largest is recomputed.
    assert!(tracker.record_trade(&trade(4, 300, 11)).is_some());
    let aggregate = tracker.snapshot(&btc());
    assert_eq!(aggregate.count, 2);
    assert_eq!(aggregate.buy_volume, Decimal::from(500));
    assert_eq!(aggregate.largest_trade.unwrap().trade_id, 4);

    // Older than the window relative to the newest trade.
    assert!(tracker.record_trade(&trade(5, 1_000, 0)).is_none());

    // Trade 2 decays; retention trims `recent` but not the window totals.
    for id in 6..=9 {
        tracker.record_trade(&trade(id, 150, 12));
    }
    let aggregate = tracker.snapshot(&btc());
    assert_eq!(aggregate.count, 5);
    assert_eq!(aggregate.buy_volume, Decimal::from(900));
    let recent: Vec<u64> = aggregate.recent.iter().map(|t| t.trade_id).collect();
    assert_eq!(recent, vec![9, 8, 7]);
    assert_eq!(aggregate.largest_trade.unwrap().trade_id, 4);

    tracker.stop();
    mux.shutdown().await;
}
