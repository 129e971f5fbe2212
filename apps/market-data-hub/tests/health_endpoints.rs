//! Health Endpoint Integration Tests
//!
//! Drives the health router in-process against a hub wired to the in-memory
//! transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use market_data_hub::application::ports::{InMemoryLedgerStore, SystemClock};
use market_data_hub::infrastructure::binance::BinanceStreamProvider;
use market_data_hub::infrastructure::health::router;
use market_data_hub::infrastructure::websocket::MemoryTransport;
use market_data_hub::{
    HealthServerState, HubDependencies, HubSettings, MarketDataHub, Provider, QuotaPolicy,
};

const BODY_LIMIT: usize = 1024 * 1024;

async fn hub() -> MarketDataHub {
    let settings = HubSettings {
        quotas: HashMap::from([(
            Provider::CoinGecko,
            QuotaPolicy {
                per_minute: Some(30),
                daily: None,
                monthly: Some(10_000),
            },
        )]),
        ..HubSettings::default()
    };
    let deps = HubDependencies {
        stream_providers: vec![Arc::new(BinanceStreamProvider::default())],
        transport: Arc::new(MemoryTransport::new()),
        rest_providers: Vec::new(),
        ledger_store: Arc::new(InMemoryLedgerStore::new()),
        clock: Arc::new(SystemClock),
    };
    MarketDataHub::init(settings, deps).await.unwrap()
}

fn app(hub: &MarketDataHub) -> Router {
    router(Arc::new(HealthServerState::new(
        "test".to_string(),
        hub.facade(),
    )))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

// =============================================================================
// Liveness and readiness
// =============================================================================

#[tokio::test]
async fn liveness_and_readiness_with_no_channels() {
    let hub = hub().await;
    let app = app(&hub);

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, body) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"READY");

    hub.shutdown().await;
}

#[tokio::test]
async fn health_reports_version_and_channels() {
    let hub = hub().await;
    let app = app(&hub);

    let (status, json) = get_json(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], "test");
    assert!(json["channels"].as_array().unwrap().is_empty());

    hub.shutdown().await;
}

// =============================================================================
// Data
// =============================================================================

#[tokio::test]
async fn usage_lists_every_provider() {
    let hub = hub().await;
    hub.facade()
        .ledger()
        .try_consume(Provider::CoinGecko, chrono::Utc::now());
    let app = app(&hub);

    let (status, json) = get_json(&app, "/usage").await;

    assert_eq!(status, StatusCode::OK);
    let providers = json["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 3);
    let coingecko = providers
        .iter()
        .find(|p| p["provider"] == "coingecko")
        .unwrap();
    assert_eq!(coingecko["pressure"], "ok");
    assert_eq!(coingecko["windows"][0]["count"], 1);
    assert_eq!(coingecko["windows"][0]["limit"], 30);
    assert_eq!(coingecko["requests"]["total"], 0);

    hub.shutdown().await;
}

#[tokio::test]
async fn trades_endpoint_maps_errors_to_status_codes() {
    let hub = hub().await;
    let app = app(&hub);

    let (status, json) = get_json(&app, "/trades/BTC-USDT").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["symbol"], "BTC-USDT");
    assert_eq!(json["count"], 0);

    let (status, json) = get_json(&app, "/trades/bad").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, _) = get_json(&app, "/trades/BTC-XYZ").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    hub.shutdown().await;

    let (status, _) = get_json(&app, "/trades/ETH-USDT").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
