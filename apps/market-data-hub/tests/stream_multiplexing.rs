//! Stream Multiplexing Integration Tests
//!
//! Drives the multiplexer over the in-memory transport with real Binance
//! frames: connection sharing, grace-period teardown, ordering, failure
//! handling and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Barrier, mpsc};
use tokio::time::timeout;

use market_data_hub::application::services::{
    MessageCallback, MultiplexerConfig, ReconnectConfig,
};
use market_data_hub::infrastructure::binance::BinanceStreamProvider;
use market_data_hub::infrastructure::websocket::MemoryTransport;
use market_data_hub::{
    ChannelKey, ChannelMessage, ConnectionState, MarketDataError, MarketEvent, Provider,
    StreamMultiplexer, SubscriptionHandle, Symbol, async_callback, callback,
};

const BTC_TRADES: &str = "btcusdt@trade";
const WAIT: Duration = Duration::from_secs(2);

fn config() -> MultiplexerConfig {
    MultiplexerConfig {
        grace_period: Duration::from_millis(150),
        callback_timeout: Duration::from_millis(50),
        stabilization_window: Duration::from_secs(10),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
    }
}

fn multiplexer(transport: &MemoryTransport) -> StreamMultiplexer {
    StreamMultiplexer::new(
        vec![Arc::new(BinanceStreamProvider::default())],
        Arc::new(transport.clone()),
        config(),
    )
}

fn btc_trades() -> ChannelKey {
    ChannelKey::trades(Provider::Binance, Symbol::parse("BTC-USDT").unwrap())
}

fn trade_frame(trade_id: u64) -> String {
    format!(
        r#"{{"e":"trade","E":1700000000000,"s":"BTCUSDT","t":{trade_id},"p":"37000.00","q":"0.01","T":1700000000000,"m":false,"M":true}}"#
    )
}

/// Callback that forwards trade ids and errors into a channel.
fn forwarding() -> (
    MessageCallback,
    mpsc::UnboundedReceiver<Result<u64, MarketDataError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb = callback(move |message| {
        let item = match message {
            ChannelMessage::Event(event) => match event.as_ref() {
                MarketEvent::Trade(trade) => Ok(trade.trade_id),
                _ => return,
            },
            ChannelMessage::Error(e) => Err(e),
        };
        let _ = tx.send(item);
    });
    (cb, rx)
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

async fn next_item(
    rx: &mut mpsc::UnboundedReceiver<Result<u64, MarketDataError>>,
) -> Result<u64, MarketDataError> {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn burst_of_subscribers_shares_one_connection() {
    let transport = MemoryTransport::new().with_connect_delay(Duration::from_millis(30));
    let mux = multiplexer(&transport);

    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let (cb, rx) = forwarding();
        handles.push(mux.subscribe(btc_trades(), cb).unwrap());
        receivers.push(rx);
    }

    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(mux.subscriber_count(&btc_trades()), 10);
    assert_eq!(mux.channel_count(), 1);

    assert_eq!(transport.push_text_matching(BTC_TRADES, &trade_frame(7)), 1);
    for rx in &mut receivers {
        assert_eq!(next_item(rx).await.unwrap(), 7);
    }

    mux.shutdown().await;
}

#[tokio::test]
async fn subscribe_message_names_the_stream() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    let (cb, _rx) = forwarding();
    let _handle = mux.subscribe(btc_trades(), cb).unwrap();

    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    let request: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(request["method"], "SUBSCRIBE");
    assert_eq!(request["params"][0], BTC_TRADES);

    mux.shutdown().await;
}

#[tokio::test]
async fn resubscribe_within_grace_period_reuses_connection() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let (cb, _rx) = forwarding();
    let first = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    mux.unsubscribe(&first);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (cb, mut rx) = forwarding();
    let second = mux.subscribe(btc_trades(), cb).unwrap();

    // Past the original grace deadline the channel is still alive.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(mux.channel_count(), 1);
    assert_eq!(
        mux.connection_state(&btc_trades()),
        Some(ConnectionState::Connected)
    );

    transport.push_text_matching(BTC_TRADES, &trade_frame(1));
    assert_eq!(next_item(&mut rx).await.unwrap(), 1);

    mux.unsubscribe(&second);
    mux.shutdown().await;
}

#[tokio::test]
async fn last_unsubscribe_tears_down_after_grace_period() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let (cb, _rx) = forwarding();
    let handle = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    mux.unsubscribe(&handle);
    mux.unsubscribe(&handle);
    assert!(!handle.is_active());
    assert_eq!(mux.channel_count(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(mux.channel_count(), 0);
    assert_eq!(transport.active_sessions(), 0);
    assert_eq!(mux.connection_state(&btc_trades()), None);

    // A fresh subscribe opens a new connection.
    let (cb, _rx) = forwarding();
    let _again = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    assert_eq!(transport.connect_count(), 2);

    mux.shutdown().await;
}

#[tokio::test]
async fn events_arrive_in_upstream_order() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    let (cb, mut rx) = forwarding();
    let _handle = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    for id in 1..=50 {
        transport.push_text_matching(BTC_TRADES, &trade_frame(id));
    }

    let mut received = Vec::new();
    for _ in 1..=50 {
        received.push(next_item(&mut rx).await.unwrap());
    }
    assert_eq!(received, (1..=50).collect::<Vec<u64>>());

    mux.shutdown().await;
}

#[tokio::test]
async fn unparseable_frames_are_dropped_without_reconnecting() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    let (cb, mut rx) = forwarding();
    let _handle = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(BTC_TRADES, "not json");
    transport.push_text_matching(BTC_TRADES, r#"{"e":"trade","s":"BTCUSDT"}"#);
    transport.push_text_matching(BTC_TRADES, r#"{"result":null,"id":1}"#);
    transport.push_text_matching(BTC_TRADES, &trade_frame(9));

    assert_eq!(next_item(&mut rx).await.unwrap(), 9);
    assert_eq!(transport.connect_count(), 1);
    let status = &mux.channel_statuses()[0];
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.messages_received, 1);

    mux.shutdown().await;
}

#[tokio::test]
async fn upstream_rejection_is_delivered_once_and_marks_channel_failed() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    let (cb_a, mut rx_a) = forwarding();
    let (cb_b, mut rx_b) = forwarding();
    let _a = mux.subscribe(btc_trades(), cb_a).unwrap();
    let _b = mux.subscribe(btc_trades(), cb_b).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(
        BTC_TRADES,
        r#"{"error":{"code":2,"msg":"Invalid request: unknown stream"},"id":1}"#,
    );

    for rx in [&mut rx_a, &mut rx_b] {
        let err = next_item(rx).await.unwrap_err();
        assert!(matches!(err, MarketDataError::UpstreamRejected { .. }));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(
        mux.connection_state(&btc_trades()),
        Some(ConnectionState::Failed)
    );
    assert!(mux.channel_statuses()[0].last_error.is_some());

    // The next subscribe retries the channel.
    let (cb, _rx) = forwarding();
    let _c = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    assert_eq!(transport.connect_count(), 2);

    mux.shutdown().await;
}

#[tokio::test]
async fn subscribe_during_rejection_delivery_restarts_channel() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let _first = mux
        .subscribe(
            btc_trades(),
            async_callback(move |message| {
                let entered = entered_tx.clone();
                async move {
                    if matches!(message, ChannelMessage::Error(_)) {
                        let _ = entered.send(());
                        tokio::time::sleep(Duration::from_millis(40)).await;
                    }
                }
            }),
        )
        .unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(
        BTC_TRADES,
        r#"{"error":{"code":2,"msg":"Invalid request: unknown stream"},"id":1}"#,
    );
    timeout(WAIT, entered_rx.recv()).await.unwrap().unwrap();

    // The first subscriber is still inside its error callback.
    let (cb, mut rx) = forwarding();
    let _late = mux.subscribe(btc_trades(), cb).unwrap();

    assert!(wait_until(|| transport.connect_count() == 2).await);
    assert!(
        wait_until(|| mux.connection_state(&btc_trades()) == Some(ConnectionState::Connected))
            .await
    );
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    transport.push_text_matching(BTC_TRADES, &trade_frame(9));
    assert_eq!(next_item(&mut rx).await.unwrap(), 9);

    mux.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_subscribe_burst_opens_one_connection() {
    const TASKS: usize = 64;
    let transport = MemoryTransport::new().with_connect_delay(Duration::from_millis(20));
    let mux = multiplexer(&transport);
    let barrier = Arc::new(Barrier::new(TASKS));

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let mux = mux.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                mux.subscribe(btc_trades(), callback(|_| {}))
            })
        })
        .collect();
    let mut handles = Vec::with_capacity(TASKS);
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(mux.channel_count(), 1);
    assert_eq!(mux.subscriber_count(&btc_trades()), TASKS);
    assert!(handles.iter().all(SubscriptionHandle::is_active));

    mux.shutdown().await;
}

#[tokio::test]
async fn blocking_sync_callback_runs_to_completion() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let finished = Arc::new(AtomicUsize::new(0));
    let blocking_finished = Arc::clone(&finished);
    let _blocking = mux
        .subscribe(
            btc_trades(),
            callback(move |_| {
                std::thread::sleep(Duration::from_millis(80));
                blocking_finished.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let (cb, mut rx) = forwarding();
    let _other = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(BTC_TRADES, &trade_frame(1));

    assert_eq!(next_item(&mut rx).await.unwrap(), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    mux.shutdown().await;
}

#[tokio::test]
async fn slow_callback_misses_message_without_blocking_others() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let completed = Arc::new(AtomicUsize::new(0));
    let slow_completed = Arc::clone(&completed);
    let _slow = mux
        .subscribe(
            btc_trades(),
            async_callback(move |_| {
                let completed = Arc::clone(&slow_completed);
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();
    let (cb, mut rx) = forwarding();
    let _fast = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(BTC_TRADES, &trade_frame(1));
    transport.push_text_matching(BTC_TRADES, &trade_frame(2));

    assert_eq!(next_item(&mut rx).await.unwrap(), 1);
    assert_eq!(next_item(&mut rx).await.unwrap(), 2);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    assert_eq!(transport.connect_count(), 1);

    mux.shutdown().await;
}

#[tokio::test]
async fn callback_may_unsubscribe_itself() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);

    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(AtomicUsize::new(0));
    let handle = {
        let inner_mux = mux.clone();
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        mux.subscribe(
            btc_trades(),
            callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().take() {
                    inner_mux.unsubscribe(&handle);
                }
            }),
        )
        .unwrap()
    };
    *slot.lock() = Some(handle.clone());

    let (cb, mut rx) = forwarding();
    let _observer = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    for id in 1..=3 {
        transport.push_text_matching(BTC_TRADES, &trade_frame(id));
    }
    for id in 1..=3 {
        assert_eq!(next_item(&mut rx).await.unwrap(), id);
    }

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(!handle.is_active());
    assert_eq!(mux.subscriber_count(&btc_trades()), 1);

    mux.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_reconnects_with_growing_backoff() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    transport.fail_next_connects(3);

    let (cb, mut rx) = forwarding();
    let _handle = mux.subscribe(btc_trades(), cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    let times = transport.connect_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(20));
    assert!(gaps[1] >= Duration::from_millis(40));
    assert!(gaps[2] >= Duration::from_millis(80));

    let status = &mux.channel_statuses()[0];
    assert_eq!(status.reconnects, 3);

    // A peer close after connecting is also retried.
    transport.close_matching(BTC_TRADES);
    assert!(wait_until(|| transport.connect_count() == 5).await);
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);

    transport.push_text_matching(BTC_TRADES, &trade_frame(11));
    assert_eq!(next_item(&mut rx).await.unwrap(), 11);

    mux.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_everything() {
    let transport = MemoryTransport::new();
    let mux = multiplexer(&transport);
    let (cb, _rx) = forwarding();
    let handle = mux.subscribe(btc_trades(), cb).unwrap();
    let eth = ChannelKey::ticker(Provider::Binance, Symbol::parse("ETH-USDT").unwrap());
    let (cb, _rx2) = forwarding();
    let _eth = mux.subscribe(eth, cb).unwrap();
    assert!(transport.wait_for_session(BTC_TRADES, WAIT).await);
    assert!(transport.wait_for_session("ethusdt@ticker", WAIT).await);

    mux.shutdown().await;

    assert!(mux.is_shutting_down());
    assert!(!handle.is_active());
    assert_eq!(mux.channel_count(), 0);
    assert_eq!(transport.active_sessions(), 0);

    let (cb, _rx) = forwarding();
    assert!(matches!(
        mux.subscribe(btc_trades(), cb),
        Err(MarketDataError::ShuttingDown)
    ));
}
