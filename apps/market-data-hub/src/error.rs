//! Market Data Errors
//!
//! One error type crosses every layer of the hub. It is `Clone` so a single
//! coalesced fetch result can be handed to every waiter, and so one upstream
//! rejection can be delivered to every subscriber of a channel.
//!
//! # Recovery
//!
//! | Variant | Who recovers |
//! |---|---|
//! | `Transport` | Multiplexer reconnects with backoff |
//! | `Protocol` | Multiplexer drops the message and keeps the connection |
//! | `QuotaExceeded` | Facade tries the next provider, then the cache |
//! | `UnsupportedSymbol` | Nobody; fails fast and is never retried |
//! | `UpstreamRejected` | Surfaced once; channel stays failed until resubscribed |

use chrono::{DateTime, Utc};

use crate::domain::symbol::Provider;

/// Errors produced by providers, the multiplexer, the cache and the facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketDataError {
    /// Connection-level failure (connect, close, timeout, 5xx).
    #[error("transport error ({origin}): {message}")]
    Transport {
        /// Provider name or endpoint that failed.
        origin: String,
        /// Error details.
        message: String,
    },

    /// Malformed or unexpected payload.
    #[error("protocol error ({origin}): {message}")]
    Protocol {
        /// Provider name or endpoint that sent the payload.
        origin: String,
        /// Error details.
        message: String,
    },

    /// Provider quota is exhausted.
    #[error("quota exceeded for {provider}")]
    QuotaExceeded {
        /// Provider whose quota is exhausted.
        provider: Provider,
        /// Earliest time a retry may succeed, if known.
        retry_at: Option<DateTime<Utc>>,
    },

    /// Symbol has no mapping for the provider.
    #[error("symbol {symbol} is not supported by {provider}")]
    UnsupportedSymbol {
        /// Provider that cannot serve the symbol.
        provider: Provider,
        /// Canonical symbol.
        symbol: String,
    },

    /// Upstream explicitly refused the request or subscription.
    #[error("{provider} rejected {target}: {reason}")]
    UpstreamRejected {
        /// Rejecting provider.
        provider: Provider,
        /// Channel or request that was rejected.
        target: String,
        /// Upstream reason.
        reason: String,
    },

    /// The hub is shutting down and accepts no new work.
    #[error("market data hub is shutting down")]
    ShuttingDown,

    /// A background task failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketDataError {
    /// Build a transport error.
    pub fn transport(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Build a protocol error.
    pub fn protocol(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Whether the multiplexer should reconnect after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }

    /// Whether the facade should try the next provider after this error.
    #[must_use]
    pub const fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UnsupportedSymbol { .. } => "unsupported_symbol",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal",
        }
    }
}
