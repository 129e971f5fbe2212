//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, channel status, quota usage, large-trade
//! statistics and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with every live channel
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (checks channels)
//! - `GET /usage` - Per-provider quota usage report
//! - `GET /trades/{symbol}` - Large-trade aggregate for a symbol
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ChannelStatus, DataFacade};
use crate::domain::channel::ConnectionState;
use crate::domain::symbol::Symbol;
use crate::error::MarketDataError;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Hub version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Every live channel, ordered by key.
    pub channels: Vec<ChannelStatus>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every channel connected (or none open).
    Healthy,
    /// Some channels connecting, backing off or failed.
    Degraded,
    /// Channels are open but none is connected.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    facade: Arc<DataFacade>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, facade: Arc<DataFacade>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            facade,
        }
    }
}

/// Build the router. Exposed separately so it can be driven without a socket.
#[must_use]
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/usage", get(usage_handler))
        .route("/trades/{symbol}", get(trades_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let channels = state.facade.channel_states();
    if determine_health_status(&channels) == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn usage_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.facade.usage_report())
}

async fn trades_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = match Symbol::parse(&symbol) {
        Ok(symbol) => symbol,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match state.facade.large_trades(&symbol) {
        Ok(aggregate) => Json(aggregate).into_response(),
        Err(e) => {
            let status = match e {
                MarketDataError::UnsupportedSymbol { .. } => StatusCode::NOT_FOUND,
                MarketDataError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &e.to_string())
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let channels = state.facade.channel_states();
    HealthResponse {
        status: determine_health_status(&channels),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        channels,
    }
}

fn determine_health_status(channels: &[ChannelStatus]) -> HealthStatus {
    let connected = channels
        .iter()
        .filter(|c| c.state == ConnectionState::Connected)
        .count();

    if connected == channels.len() {
        HealthStatus::Healthy
    } else if connected > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(state: ConnectionState) -> ChannelStatus {
        ChannelStatus {
            channel: "binance:trade:BTC-USDT".to_string(),
            state,
            subscribers: 1,
            messages_received: 0,
            reconnects: 0,
            last_error: None,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn no_channels_is_healthy() {
        assert_eq!(determine_health_status(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn partial_connectivity_is_degraded() {
        let channels = [
            channel(ConnectionState::Connected),
            channel(ConnectionState::Backoff { attempt: 2 }),
        ];
        assert_eq!(determine_health_status(&channels), HealthStatus::Degraded);
    }

    #[test]
    fn nothing_connected_is_unhealthy() {
        let channels = [
            channel(ConnectionState::Connecting),
            channel(ConnectionState::Failed),
        ];
        assert_eq!(determine_health_status(&channels), HealthStatus::Unhealthy);
    }

    #[test]
    fn channel_status_flattens_state() {
        let json = serde_json::to_value(channel(ConnectionState::Backoff { attempt: 3 })).unwrap();
        assert_eq!(json["state"], "backoff");
        assert_eq!(json["attempt"], 3);
    }
}
