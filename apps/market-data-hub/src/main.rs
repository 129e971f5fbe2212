//! Market Data Hub Binary
//!
//! Starts the market data hub with its health and metrics endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-hub
//! ```
//!
//! # Environment Variables
//!
//! All variables are optional.
//!
//! - `HUB_HEALTH_PORT`: Health check HTTP port (default: 8085)
//! - `BINANCE_WS_URL`: Binance WebSocket endpoint
//! - `COINGECKO_API_KEY` / `CRYPTOCOMPARE_API_KEY`: REST provider keys
//! - `PROVIDER_FALLBACK_ORDER`: REST providers in order (default: coingecko,cryptocompare)
//! - `QUOTA_<PROVIDER>_<WINDOW>`: Quota limits, e.g. `QUOTA_COINGECKO_PER_MINUTE=30`
//! - `WATCH_SYMBOLS`: Symbols whose large trades are tracked (default: BTC-USDT,ETH-USDT)
//! - `WHALE_THRESHOLD_DEFAULT`: Large-trade notional threshold (default: 100000)
//! - `LEDGER_PATH`: Rate-limit ledger file (default: data/rate-limit-ledger.json)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_data_hub::infrastructure::health::{HealthServer, HealthServerState};
use market_data_hub::infrastructure::telemetry;
use market_data_hub::{HubConfig, MarketDataHub, build_dependencies, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Data Hub");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Build adapters and the hub registry
    let deps = build_dependencies(&config)?;
    let hub = MarketDataHub::init(config.hub_settings(), deps).await?;

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        hub.facade(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market data hub ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, hub.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Hub shutdown timed out"
        );
    }

    tracing::info!("Market data hub stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    let fallback: Vec<&str> = config
        .providers
        .fallback_order
        .iter()
        .map(|p| p.as_str())
        .collect();
    let watch: Vec<String> = config
        .tracker
        .watch_symbols
        .iter()
        .map(ToString::to_string)
        .collect();

    tracing::info!(
        health_port = config.server.health_port,
        fallback_order = %fallback.join(","),
        watch_symbols = %watch.join(","),
        whale_threshold = %config.tracker.default_threshold,
        ledger_path = %config.ledger.path.display(),
        "Configuration loaded"
    );
    tracing::debug!(
        binance_url = %config.stream.binance_url,
        coingecko_url = %config.providers.coingecko_url,
        cryptocompare_url = %config.providers.cryptocompare_url,
        coingecko_key = config.providers.coingecko_key.is_some(),
        cryptocompare_key = config.providers.cryptocompare_key.is_some(),
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
