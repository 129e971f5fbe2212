//! Prometheus Metrics Module
//!
//! Exposes hub metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Streams**: Messages received and dropped, live channels, subscribers,
//!   reconnects, callback delivery latency
//! - **Cache**: Lookups by outcome (hit, miss, coalesced, stale)
//! - **Providers**: REST requests by outcome, quota rejections
//! - **Aggregation**: Large trades detected
//!
//! # Integration
//!
//! Metrics are rendered at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::channel::StreamKind;
use crate::domain::market::TakerSide;
use crate::domain::symbol::Provider;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle from the first call.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Streams
    describe_counter!(
        "market_hub_messages_received_total",
        "Events decoded from upstream streams"
    );
    describe_counter!(
        "market_hub_messages_dropped_total",
        "Messages dropped by reason"
    );
    describe_gauge!(
        "market_hub_live_channels",
        "Channels currently held open, including those in their grace period"
    );
    describe_gauge!(
        "market_hub_subscribers",
        "Registered stream subscribers"
    );
    describe_counter!(
        "market_hub_reconnects_total",
        "Upstream reconnect attempts"
    );
    describe_histogram!(
        "market_hub_delivery_seconds",
        "Time spent in one subscriber callback"
    );

    // Cache
    describe_counter!(
        "market_hub_cache_lookups_total",
        "Response cache lookups by outcome"
    );

    // Providers
    describe_counter!(
        "market_hub_provider_requests_total",
        "REST provider requests by outcome"
    );
    describe_counter!(
        "market_hub_quota_rejections_total",
        "Calls refused by the rate limit ledger"
    );

    // Aggregation
    describe_counter!(
        "market_hub_large_trades_total",
        "Trades at or above the large-trade threshold"
    );
}

// =============================================================================
// Labels
// =============================================================================

/// Why a message was dropped.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Frame could not be decoded.
    ParseFailure,
    /// Subscriber callback exceeded its timeout.
    CallbackTimeout,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ParseFailure => "parse_failure",
            Self::CallbackTimeout => "callback_timeout",
        }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy)]
pub enum CacheOutcome {
    /// Fresh entry served.
    Hit,
    /// Caller triggered the fetch.
    Miss,
    /// Caller joined a fetch already in flight.
    Coalesced,
    /// Expired entry served after a failed fetch.
    Stale,
}

impl CacheOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Coalesced => "coalesced",
            Self::Stale => "stale",
        }
    }
}

/// Outcome of a REST provider request.
#[derive(Debug, Clone, Copy)]
pub enum RequestOutcome {
    /// Response decoded.
    Success,
    /// Provider answered with a quota error.
    QuotaExceeded,
    /// Any other failure.
    Error,
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Error => "error",
        }
    }
}

const fn side_label(side: TakerSide) -> &'static str {
    match side {
        TakerSide::Buy => "buy",
        TakerSide::Sell => "sell",
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an event decoded from an upstream stream.
pub fn record_message_received(provider: Provider, kind: StreamKind) {
    counter!(
        "market_hub_messages_received_total",
        "provider" => provider.as_str(),
        "stream" => kind.label()
    )
    .increment(1);
}

/// Record a dropped message.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "market_hub_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record the time one subscriber callback took.
pub fn record_delivery_duration(duration: Duration) {
    histogram!("market_hub_delivery_seconds").record(duration.as_secs_f64());
}

/// Update the live channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_live_channels(count: usize) {
    gauge!("market_hub_live_channels").set(count as f64);
}

/// Record a new subscriber.
pub fn increment_subscribers() {
    gauge!("market_hub_subscribers").increment(1.0);
}

/// Record a removed subscriber.
pub fn decrement_subscribers() {
    gauge!("market_hub_subscribers").decrement(1.0);
}

/// Record a reconnect attempt.
pub fn record_reconnect(provider: Provider) {
    counter!(
        "market_hub_reconnects_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record a cache lookup.
pub fn record_cache_outcome(cache: &'static str, outcome: CacheOutcome) {
    counter!(
        "market_hub_cache_lookups_total",
        "cache" => cache,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a REST provider request.
pub fn record_provider_request(provider: Provider, outcome: RequestOutcome) {
    counter!(
        "market_hub_provider_requests_total",
        "provider" => provider.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a call refused by the ledger.
pub fn record_quota_rejection(provider: Provider) {
    counter!(
        "market_hub_quota_rejections_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record a detected large trade.
pub fn record_large_trade(side: TakerSide) {
    counter!(
        "market_hub_large_trades_total",
        "side" => side_label(side)
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::ParseFailure.as_str(), "parse_failure");
        assert_eq!(DropReason::CallbackTimeout.as_str(), "callback_timeout");
    }

    #[test]
    fn cache_outcome_as_str() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Miss.as_str(), "miss");
        assert_eq!(CacheOutcome::Coalesced.as_str(), "coalesced");
        assert_eq!(CacheOutcome::Stale.as_str(), "stale");
    }

    #[test]
    fn request_outcome_as_str() {
        assert_eq!(RequestOutcome::Success.as_str(), "success");
        assert_eq!(RequestOutcome::QuotaExceeded.as_str(), "quota_exceeded");
        assert_eq!(RequestOutcome::Error.as_str(), "error");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received(Provider::Binance, StreamKind::Trade);
        record_large_trade(TakerSide::Sell);
        set_live_channels(3);
    }
}
