//! Channel Keys and Connection State
//!
//! A channel key names exactly one physical upstream subscription. The
//! multiplexer keeps at most one live connection per key.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::symbol::{Provider, Symbol};

// =============================================================================
// Stream Kinds
// =============================================================================

/// Candlestick interval for kline streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    /// One minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// Five minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// Four hours.
    #[serde(rename = "4h")]
    FourHours,
    /// One day.
    #[serde(rename = "1d")]
    OneDay,
}

impl KlineInterval {
    /// Interval code as used on the wire (`1m`, `4h`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    /// Parse an interval code.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::OneMinute),
            "5m" => Some(Self::FiveMinutes),
            "15m" => Some(Self::FifteenMinutes),
            "1h" => Some(Self::OneHour),
            "4h" => Some(Self::FourHours),
            "1d" => Some(Self::OneDay),
            _ => None,
        }
    }
}

/// Kind of upstream stream. Stream parameters travel inside the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Rolling 24h ticker updates.
    Ticker,
    /// Individual trades.
    Trade,
    /// Order book deltas.
    OrderBook,
    /// Candlesticks for the given interval.
    Kline(KlineInterval),
}

impl StreamKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::OrderBook => "order_book",
            Self::Kline(_) => "kline",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kline(interval) => write!(f, "kline_{}", interval.as_str()),
            other => f.write_str(other.label()),
        }
    }
}

// =============================================================================
// Channel Key
// =============================================================================

/// Identity of one physical upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Stream provider.
    pub provider: Provider,
    /// Stream kind (with parameters).
    pub kind: StreamKind,
    /// Canonical symbol.
    pub symbol: Symbol,
}

impl ChannelKey {
    /// Create a channel key.
    #[must_use]
    pub const fn new(provider: Provider, kind: StreamKind, symbol: Symbol) -> Self {
        Self {
            provider,
            kind,
            symbol,
        }
    }

    /// Trade channel for a symbol.
    #[must_use]
    pub const fn trades(provider: Provider, symbol: Symbol) -> Self {
        Self::new(provider, StreamKind::Trade, symbol)
    }

    /// Ticker channel for a symbol.
    #[must_use]
    pub const fn ticker(provider: Provider, symbol: Symbol) -> Self {
        Self::new(provider, StreamKind::Ticker, symbol)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.kind, self.symbol)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one channel's physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no worker.
    Disconnected,
    /// Worker is opening the connection.
    Connecting,
    /// Connection is open and subscribed.
    Connected,
    /// Waiting before reconnect attempt `attempt`.
    Backoff {
        /// Reconnect attempt number (1-based).
        attempt: u32,
    },
    /// Upstream rejected the subscription; waits for a fresh subscribe.
    Failed,
}

impl ConnectionState {
    /// Short label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff { .. } => "backoff",
            Self::Failed => "failed",
        }
    }
}
