//! Reconnection Policy
//!
//! Exponential backoff with jitter for channel reconnects.
//!
//! - The raw delay for attempt `n` (0-based) is
//!   `min(max_delay, initial_delay * multiplier^n)`.
//! - Jitter shaves up to `jitter_factor` of the raw delay off, so a jittered
//!   delay never exceeds `max_delay`.
//! - Delays are non-decreasing across consecutive attempts until `reset`.
//!
//! Retries are unbounded; a channel keeps reconnecting for as long as it
//! has subscribers.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt (2.0 doubles the delay).
    pub multiplier: f64,
    /// Fraction of the raw delay that jitter may remove (0.2 = up to 20%).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
    last_delay: Duration,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay(self.attempt_count);
        let jittered = self.apply_jitter(raw);
        let delay = jittered.max(self.last_delay).min(self.config.max_delay);

        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    /// Reset after a connection stayed up past the stabilization window.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent))
        .round();
        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.config.max_delay.as_millis() as f64;
        if scaled.is_finite() && scaled >= 0.0 && scaled < max_millis {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millis = scaled as u64;
            Duration::from_millis(millis)
        } else {
            self.config.max_delay
        }
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let factor = self.config.jitter_factor.min(1.0);
        let cut: f64 = rand::rng().random_range(0.0..=base_millis * factor);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base_millis - cut).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}
