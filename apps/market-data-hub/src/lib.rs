#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss
    )
)]

//! Market Data Hub - Crypto Stream Multiplexer and REST Fallback Router
//!
//! Maintains at most one upstream exchange WebSocket per channel and fans
//! its events out to any number of in-process subscribers. Historical and
//! spot queries go through a coalescing cache, a persisted rate-limit
//! ledger and a fixed provider fallback chain. A large-trade tracker folds
//! trade channels into per-symbol aggregates.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data types and pure aggregation/quota logic
//!   - `symbol`, `channel`: canonical symbols, providers, channel keys
//!   - `market`: normalized events, snapshots, historical series
//!   - `aggregation`: large-trade windows
//!   - `quota`: quota windows, reset horizons, pressure levels
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: stream providers and transports, REST providers, ledger
//!     storage, clock
//!   - `services`: multiplexer, ledger, cache, tracker, facade, hub registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: stream protocol adapter
//!   - `websocket`: tungstenite and in-memory transports
//!   - `rest`: CoinGecko and CryptoCompare adapters
//!   - `persistence`: JSON ledger file
//!   - `config`: configuration and dependency wiring
//!   - `health`: health, usage and metrics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──► StreamMultiplexer ──┬──► subscriber callbacks
//!  (1 per key)                       ├──► PriceBook ──► GetRealtime
//!                                    └──► LargeTradeTracker
//!
//! GetHistorical / GetSpot ──► ResponseCache ──► RateLimitLedger ──► CoinGecko
//!                                                            └────► CryptoCompare
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error taxonomy shared by every layer.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::aggregation::{LargeTrade, TradeAggregate};
pub use domain::channel::{ChannelKey, ConnectionState, KlineInterval, StreamKind};
pub use domain::market::{
    HistoricalSeries, HistoryRange, MarketEvent, PriceSnapshot, SpotPrice, TakerSide, TradeEvent,
};
pub use domain::quota::{PressureLevel, QuotaPolicy, WindowKind};
pub use domain::symbol::{Provider, Symbol};
pub use error::MarketDataError;

// Services
pub use application::services::{
    CacheLookup, ChannelMessage, DataFacade, HubDependencies, HubSettings, MarketDataHub,
    StreamMultiplexer, SubscriptionHandle, UsageReport, async_callback, callback,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, HubConfig, build_dependencies};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
