//! Hub Configuration Settings
//!
//! Configuration types for the hub, loaded from environment variables.
//! Every variable is optional. A value that is present but unparseable is an
//! error rather than a silent fallback to the default.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use rust_decimal::Decimal;

use crate::application::services::{
    FacadeConfig, HubSettings, MultiplexerConfig, ReconnectConfig, TrackerConfig,
};
use crate::domain::aggregation::RetentionPolicy;
use crate::domain::quota::{QuotaPolicy, WindowKind};
use crate::domain::symbol::{Provider, Symbol};
use crate::infrastructure::binance::DEFAULT_STREAM_URL;
use crate::infrastructure::rest::{coingecko, cryptocompare};
use crate::infrastructure::websocket::WsTransportConfig;

// =============================================================================
// Errors
// =============================================================================

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is set but cannot be used.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Settings Groups
// =============================================================================

/// Provider API key. Redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key.
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self(key)
    }

    /// The raw key.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8085 }
    }
}

/// Streaming connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Binance stream endpoint.
    pub binance_url: String,
    /// Idle channel lifetime after the last unsubscribe.
    pub grace_period: Duration,
    /// Per-message callback budget.
    pub callback_timeout: Duration,
    /// Uptime after which reconnect backoff resets.
    pub stabilization_window: Duration,
    /// Initial reconnect delay.
    pub reconnect_initial: Duration,
    /// Maximum reconnect delay.
    pub reconnect_max: Duration,
    /// Fraction of each delay that jitter may remove.
    pub reconnect_jitter: f64,
    /// Client ping interval.
    pub ping_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            binance_url: DEFAULT_STREAM_URL.to_string(),
            grace_period: Duration::from_millis(5000),
            callback_timeout: Duration::from_millis(250),
            stabilization_window: Duration::from_secs(10),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.2,
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Entries per cache.
    pub capacity: usize,
    /// Historical series TTL.
    pub history_ttl: Duration,
    /// Spot price TTL.
    pub spot_ttl: Duration,
    /// Serve expired entries when a refetch fails.
    pub serve_stale: bool,
    /// Age after which a realtime snapshot is tagged stale.
    pub realtime_stale_after: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 512,
            history_ttl: Duration::from_secs(300),
            spot_ttl: Duration::from_secs(15),
            serve_stale: true,
            realtime_stale_after: Duration::from_secs(10),
        }
    }
}

/// REST provider settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// REST providers in the order they are tried.
    pub fallback_order: Vec<Provider>,
    /// CoinGecko base URL.
    pub coingecko_url: String,
    /// CoinGecko API key.
    pub coingecko_key: Option<ApiKey>,
    /// CryptoCompare base URL.
    pub cryptocompare_url: String,
    /// CryptoCompare API key.
    pub cryptocompare_key: Option<ApiKey>,
    /// Per-request timeout.
    pub http_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            fallback_order: vec![Provider::CoinGecko, Provider::CryptoCompare],
            coingecko_url: coingecko::DEFAULT_BASE_URL.to_string(),
            coingecko_key: None,
            cryptocompare_url: cryptocompare::DEFAULT_BASE_URL.to_string(),
            cryptocompare_key: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Large-trade tracker settings.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Notional threshold for symbols without an override.
    pub default_threshold: Decimal,
    /// Per-symbol thresholds.
    pub thresholds: HashMap<Symbol, Decimal>,
    /// Trades retained per symbol.
    pub retention: usize,
    /// Trailing window for running totals.
    pub window: Duration,
    /// Symbols tracked from startup.
    pub watch_symbols: Vec<Symbol>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            default_threshold: Decimal::from(100_000),
            thresholds: HashMap::new(),
            retention: 100,
            window: Duration::from_secs(3600),
            watch_symbols: default_watch_symbols(),
        }
    }
}

fn default_watch_symbols() -> Vec<Symbol> {
    ["BTC-USDT", "ETH-USDT"]
        .iter()
        .filter_map(|s| Symbol::parse(s).ok())
        .collect()
}

/// Rate-limit ledger settings.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Ledger file.
    pub path: PathBuf,
    /// Interval between flushes.
    pub flush_interval: Duration,
    /// Offset for daily and monthly resets. `None` uses the host's offset.
    pub utc_offset: Option<FixedOffset>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/rate-limit-ledger.json"),
            flush_interval: Duration::from_secs(30),
            utc_offset: None,
        }
    }
}

/// Default quota policies for the free tiers.
#[must_use]
pub fn default_quotas() -> HashMap<Provider, QuotaPolicy> {
    HashMap::from([
        (
            Provider::CoinGecko,
            QuotaPolicy {
                per_minute: Some(30),
                daily: None,
                monthly: Some(10_000),
            },
        ),
        (
            Provider::CryptoCompare,
            QuotaPolicy {
                per_minute: None,
                daily: None,
                monthly: Some(100_000),
            },
        ),
    ])
}

// =============================================================================
// Hub Configuration
// =============================================================================

/// Complete hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Streaming connection settings.
    pub stream: StreamSettings,
    /// Response cache settings.
    pub cache: CacheSettings,
    /// REST provider settings.
    pub providers: ProviderSettings,
    /// Quota policy per provider.
    pub quotas: HashMap<Provider, QuotaPolicy>,
    /// Large-trade tracker settings.
    pub tracker: TrackerSettings,
    /// Ledger settings.
    pub ledger: LedgerSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unusable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let server = ServerSettings {
            health_port: env.parse("HUB_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            binance_url: env.string("BINANCE_WS_URL", defaults.binance_url),
            grace_period: env.millis("STREAM_GRACE_PERIOD_MS", defaults.grace_period)?,
            callback_timeout: env.millis("STREAM_CALLBACK_TIMEOUT_MS", defaults.callback_timeout)?,
            stabilization_window: env
                .secs("STREAM_STABILIZATION_SECS", defaults.stabilization_window)?,
            reconnect_initial: env.millis("STREAM_RECONNECT_BASE_MS", defaults.reconnect_initial)?,
            reconnect_max: env.secs("STREAM_RECONNECT_MAX_SECS", defaults.reconnect_max)?,
            reconnect_jitter: env.fraction("STREAM_RECONNECT_JITTER", defaults.reconnect_jitter)?,
            ping_interval: env.secs("STREAM_PING_INTERVAL_SECS", defaults.ping_interval)?,
            idle_timeout: env.secs("STREAM_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
        };

        let defaults = CacheSettings::default();
        let cache = CacheSettings {
            capacity: env.parse("CACHE_CAPACITY", defaults.capacity)?,
            history_ttl: env.secs("CACHE_HISTORY_TTL_SECS", defaults.history_ttl)?,
            spot_ttl: env.secs("CACHE_SPOT_TTL_SECS", defaults.spot_ttl)?,
            serve_stale: env.parse("CACHE_SERVE_STALE", defaults.serve_stale)?,
            realtime_stale_after: env
                .secs("REALTIME_STALE_AFTER_SECS", defaults.realtime_stale_after)?,
        };

        let defaults = ProviderSettings::default();
        let providers = ProviderSettings {
            fallback_order: env.fallback_order("PROVIDER_FALLBACK_ORDER", defaults.fallback_order)?,
            coingecko_url: env.string("COINGECKO_API_URL", defaults.coingecko_url),
            coingecko_key: env.api_key("COINGECKO_API_KEY"),
            cryptocompare_url: env.string("CRYPTOCOMPARE_API_URL", defaults.cryptocompare_url),
            cryptocompare_key: env.api_key("CRYPTOCOMPARE_API_KEY"),
            http_timeout: env.secs("HTTP_TIMEOUT_SECS", defaults.http_timeout)?,
        };

        let mut quotas = default_quotas();
        for provider in Provider::ALL {
            let mut policy = quotas.get(&provider).copied().unwrap_or_default();
            for kind in WindowKind::ALL {
                let key = format!(
                    "QUOTA_{}_{}",
                    provider.as_str().to_uppercase(),
                    kind.as_str().to_uppercase()
                );
                if let Some(limit) = env.quota_limit(&key)? {
                    *policy_slot(&mut policy, kind) = limit;
                }
            }
            quotas.insert(provider, policy);
        }

        let defaults = TrackerSettings::default();
        let watch_symbols = env.symbols("WATCH_SYMBOLS", defaults.watch_symbols)?;
        let default_threshold =
            env.decimal("WHALE_THRESHOLD_DEFAULT", defaults.default_threshold)?;
        let mut thresholds = HashMap::new();
        for symbol in &watch_symbols {
            let key = format!("WHALE_THRESHOLD_{}_{}", symbol.base(), symbol.quote());
            if env.get(&key).is_some() {
                thresholds.insert(symbol.clone(), env.decimal(&key, default_threshold)?);
            }
        }
        let tracker = TrackerSettings {
            default_threshold,
            thresholds,
            retention: env.parse("TRACKER_RETENTION", defaults.retention)?,
            window: env.secs("TRACKER_WINDOW_SECS", defaults.window)?,
            watch_symbols,
        };

        let defaults = LedgerSettings::default();
        let ledger = LedgerSettings {
            path: env.get("LEDGER_PATH").map_or(defaults.path, PathBuf::from),
            flush_interval: env.secs("LEDGER_FLUSH_INTERVAL_SECS", defaults.flush_interval)?,
            utc_offset: env.utc_offset("LEDGER_UTC_OFFSET_MINUTES")?,
        };

        Ok(Self {
            server,
            stream,
            cache,
            providers,
            quotas,
            tracker,
            ledger,
        })
    }

    /// Settings for [`MarketDataHub::init`](crate::application::services::MarketDataHub::init).
    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        let defaults = HubSettings::default();
        HubSettings {
            multiplexer: MultiplexerConfig {
                grace_period: self.stream.grace_period,
                callback_timeout: self.stream.callback_timeout,
                stabilization_window: self.stream.stabilization_window,
                reconnect: ReconnectConfig {
                    initial_delay: self.stream.reconnect_initial,
                    max_delay: self.stream.reconnect_max,
                    jitter_factor: self.stream.reconnect_jitter,
                    ..ReconnectConfig::default()
                },
            },
            facade: FacadeConfig {
                stream_provider: Provider::Binance,
                history_ttl: self.cache.history_ttl,
                spot_ttl: self.cache.spot_ttl,
                cache_capacity: self.cache.capacity,
                serve_stale_on_error: self.cache.serve_stale,
                realtime_stale_after: chrono::Duration::from_std(self.cache.realtime_stale_after)
                    .unwrap_or(chrono::Duration::MAX),
            },
            tracker: TrackerConfig {
                default_threshold: self.tracker.default_threshold,
                thresholds: self.tracker.thresholds.clone(),
                retention: RetentionPolicy {
                    max_trades: self.tracker.retention,
                    window: chrono::Duration::from_std(self.tracker.window)
                        .unwrap_or(chrono::Duration::MAX),
                },
            },
            quotas: self.quotas.clone(),
            reset_offset: self.ledger.utc_offset.unwrap_or(defaults.reset_offset),
            ledger_flush_interval: self.ledger.flush_interval,
            watch_symbols: self.tracker.watch_symbols.clone(),
        }
    }

    /// Keepalive timing for the WebSocket transport.
    #[must_use]
    pub fn ws_transport(&self) -> WsTransportConfig {
        WsTransportConfig {
            ping_interval: self.stream.ping_interval,
            idle_timeout: self.stream.idle_timeout,
            ..WsTransportConfig::default()
        }
    }
}

const fn policy_slot(policy: &mut QuotaPolicy, kind: WindowKind) -> &mut Option<u32> {
    match kind {
        WindowKind::PerMinute => &mut policy.per_minute,
        WindowKind::Daily => &mut policy.daily,
        WindowKind::Monthly => &mut policy.monthly,
    }
}

// =============================================================================
// Variable Parsing
// =============================================================================

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn api_key(&self, key: &str) -> Option<ApiKey> {
        self.get(key).map(ApiKey::new)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, &value, e.to_string())),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse::<u64>(key, default).map(Duration::from_millis)
    }

    fn fraction(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        let value = self.parse::<f64>(key, default)?;
        if (0.0..=1.0).contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::invalid(key, &value.to_string(), "must be between 0 and 1"))
        }
    }

    fn decimal(&self, key: &str, default: Decimal) -> Result<Decimal, ConfigError> {
        let value = self.parse::<Decimal>(key, default)?;
        if value.is_sign_negative() {
            Err(ConfigError::invalid(key, &value.to_string(), "must not be negative"))
        } else {
            Ok(value)
        }
    }

    /// `none` or `unlimited` clears a window; a number sets it.
    fn quota_limit(&self, key: &str) -> Result<Option<Option<u32>>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        if value.eq_ignore_ascii_case("none") || value.eq_ignore_ascii_case("unlimited") {
            return Ok(Some(None));
        }
        value
            .parse::<u32>()
            .map(|limit| Some(Some(limit)))
            .map_err(|e| ConfigError::invalid(key, &value, e.to_string()))
    }

    fn symbols(&self, key: &str, default: Vec<Symbol>) -> Result<Vec<Symbol>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        let mut symbols = Vec::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let symbol =
                Symbol::parse(part).map_err(|e| ConfigError::invalid(key, &value, e.to_string()))?;
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        Ok(symbols)
    }

    fn fallback_order(
        &self,
        key: &str,
        default: Vec<Provider>,
    ) -> Result<Vec<Provider>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        let mut order = Vec::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let provider = Provider::from_str_case_insensitive(part)
                .ok_or_else(|| ConfigError::invalid(key, &value, format!("unknown provider {part}")))?;
            if provider == Provider::Binance {
                return Err(ConfigError::invalid(key, &value, "binance has no REST adapter"));
            }
            if !order.contains(&provider) {
                order.push(provider);
            }
        }
        if order.is_empty() {
            return Err(ConfigError::invalid(key, &value, "at least one provider is required"));
        }
        Ok(order)
    }

    fn utc_offset(&self, key: &str) -> Result<Option<FixedOffset>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let minutes: i32 = value
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::invalid(key, &value, e.to_string()))?;
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(key, &value, "offset out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<HubConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        HubConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config(&[]).unwrap();
        assert_eq!(config.server.health_port, 8085);
        assert_eq!(config.stream.binance_url, DEFAULT_STREAM_URL);
        assert_eq!(config.stream.grace_period, Duration::from_secs(5));
        assert_eq!(config.cache.history_ttl, Duration::from_secs(300));
        assert!(config.cache.serve_stale);
        assert_eq!(
            config.providers.fallback_order,
            vec![Provider::CoinGecko, Provider::CryptoCompare]
        );
        assert_eq!(config.quotas[&Provider::CoinGecko].per_minute, Some(30));
        assert!(config.quotas[&Provider::Binance].is_unmetered());
        assert_eq!(config.tracker.watch_symbols.len(), 2);
        assert_eq!(config.ledger.utc_offset, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("HUB_HEALTH_PORT", "9000"),
            ("STREAM_GRACE_PERIOD_MS", "1500"),
            ("CACHE_SERVE_STALE", "false"),
            ("PROVIDER_FALLBACK_ORDER", "cryptocompare, CoinGecko"),
            ("QUOTA_COINGECKO_PER_MINUTE", "none"),
            ("QUOTA_CRYPTOCOMPARE_DAILY", "2500"),
            ("WATCH_SYMBOLS", "sol-usdt, BTC-USDT, SOL-USDT"),
            ("WHALE_THRESHOLD_SOL_USDT", "25000"),
            ("LEDGER_UTC_OFFSET_MINUTES", "-300"),
        ])
        .unwrap();

        assert_eq!(config.server.health_port, 9000);
        assert_eq!(config.stream.grace_period, Duration::from_millis(1500));
        assert!(!config.cache.serve_stale);
        assert_eq!(
            config.providers.fallback_order,
            vec![Provider::CryptoCompare, Provider::CoinGecko]
        );
        assert_eq!(config.quotas[&Provider::CoinGecko].per_minute, None);
        assert_eq!(config.quotas[&Provider::CoinGecko].monthly, Some(10_000));
        assert_eq!(config.quotas[&Provider::CryptoCompare].daily, Some(2500));

        let sol = Symbol::parse("SOL-USDT").unwrap();
        assert_eq!(config.tracker.watch_symbols.len(), 2);
        assert_eq!(config.tracker.thresholds[&sol], Decimal::from(25_000));
        assert_eq!(
            config.ledger.utc_offset,
            FixedOffset::west_opt(5 * 3600)
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(
            config(&[("HUB_HEALTH_PORT", "ninety")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == "HUB_HEALTH_PORT"
        ));
        assert!(config(&[("STREAM_RECONNECT_JITTER", "1.5")]).is_err());
        assert!(config(&[("PROVIDER_FALLBACK_ORDER", "binance")]).is_err());
        assert!(config(&[("PROVIDER_FALLBACK_ORDER", "kraken")]).is_err());
        assert!(config(&[("WATCH_SYMBOLS", "BTCUSDT")]).is_err());
        assert!(config(&[("WHALE_THRESHOLD_DEFAULT", "-5")]).is_err());
    }

    #[test]
    fn empty_values_use_defaults() {
        let config = config(&[("HUB_HEALTH_PORT", "  "), ("COINGECKO_API_KEY", "")]).unwrap();
        assert_eq!(config.server.health_port, 8085);
        assert!(config.providers.coingecko_key.is_none());
    }

    #[test]
    fn api_keys_redacted_debug() {
        let config = config(&[("COINGECKO_API_KEY", "cg-secret-123")]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("cg-secret-123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn hub_settings_carry_values() {
        let config = config(&[
            ("LEDGER_UTC_OFFSET_MINUTES", "60"),
            ("TRACKER_RETENTION", "10"),
            ("STREAM_RECONNECT_MAX_SECS", "5"),
        ])
        .unwrap();
        let settings = config.hub_settings();

        assert_eq!(settings.reset_offset, FixedOffset::east_opt(3600).unwrap());
        assert_eq!(settings.tracker.retention.max_trades, 10);
        assert_eq!(settings.multiplexer.reconnect.max_delay, Duration::from_secs(5));
        assert_eq!(settings.facade.cache_capacity, 512);
        assert_eq!(settings.watch_symbols, config.tracker.watch_symbols);
    }
}
