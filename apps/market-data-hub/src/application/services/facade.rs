//! Data Facade
//!
//! The single entry point for consumers of market data.
//!
//! - Realtime and streaming requests go to the [`StreamMultiplexer`].
//! - Historical and spot requests go through the [`ResponseCache`], then the
//!   REST providers in fixed fallback order. The [`RateLimitLedger`] is
//!   consulted before every provider call; a provider over quota is skipped
//!   in favor of the next one. Every such request is also recorded in the
//!   ledger's request counters, cache hits included; only real upstream
//!   calls consume quota.
//! - Large-trade statistics come from the [`LargeTradeTracker`].
//!
//! Every method takes canonical symbols. Provider adapters own translation,
//! and a symbol no provider can map fails fast with `UnsupportedSymbol`.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::cache::{CacheLookup, ResponseCache};
use super::ledger::{RateLimitLedger, UsageReport};
use super::multiplexer::{
    ChannelMessage, ChannelStatus, MessageCallback, StreamMultiplexer, SubscriptionHandle,
};
use super::price_book::PriceBook;
use super::tracker::LargeTradeTracker;
use crate::application::ports::{Clock, RestProvider};
use crate::domain::aggregation::TradeAggregate;
use crate::domain::channel::{ChannelKey, StreamKind};
use crate::domain::market::{HistoricalSeries, HistoryRange, PriceSnapshot, SpotPrice};
use crate::domain::quota::PressureLevel;
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;
use crate::infrastructure::metrics::{self, RequestOutcome};

/// Facade settings.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    /// Provider used for streaming channels.
    pub stream_provider: Provider,
    /// TTL of cached historical series.
    pub history_ttl: Duration,
    /// TTL of cached spot prices.
    pub spot_ttl: Duration,
    /// Entries per response cache.
    pub cache_capacity: usize,
    /// Serve expired entries when a refetch fails.
    pub serve_stale_on_error: bool,
    /// Age after which a realtime snapshot is tagged stale.
    pub realtime_stale_after: chrono::Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            stream_provider: Provider::Binance,
            history_ttl: Duration::from_secs(300),
            spot_ttl: Duration::from_secs(15),
            cache_capacity: 512,
            serve_stale_on_error: true,
            realtime_stale_after: chrono::Duration::seconds(10),
        }
    }
}

/// Latest known price plus the subscription keeping it fresh.
#[derive(Debug, Clone)]
pub struct RealtimeQuote {
    /// Most recent snapshot, if one has arrived yet.
    pub snapshot: Option<PriceSnapshot>,
    /// Ticker subscription; release it with [`DataFacade::unsubscribe`].
    pub subscription: SubscriptionHandle,
}

/// Entry point for realtime, historical and aggregated market data.
pub struct DataFacade {
    config: FacadeConfig,
    multiplexer: StreamMultiplexer,
    providers: Vec<Arc<dyn RestProvider>>,
    ledger: Arc<RateLimitLedger>,
    tracker: Arc<LargeTradeTracker>,
    clock: Arc<dyn Clock>,
    price_book: Arc<PriceBook>,
    history_cache: ResponseCache<HistoricalSeries>,
    spot_cache: ResponseCache<SpotPrice>,
}

impl std::fmt::Debug for DataFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<Provider> = self.providers.iter().map(|p| p.provider()).collect();
        f.debug_struct("DataFacade")
            .field("config", &self.config)
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}

impl DataFacade {
    /// Create a facade. `providers` is the fixed fallback order.
    #[must_use]
    pub fn new(
        config: FacadeConfig,
        multiplexer: StreamMultiplexer,
        providers: Vec<Arc<dyn RestProvider>>,
        ledger: Arc<RateLimitLedger>,
        tracker: Arc<LargeTradeTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let price_book = Arc::new(PriceBook::new(
            config.realtime_stale_after,
            Arc::clone(&clock),
        ));
        let history_cache =
            ResponseCache::new("history", config.cache_capacity, config.serve_stale_on_error);
        let spot_cache =
            ResponseCache::new("spot", config.cache_capacity, config.serve_stale_on_error);
        Self {
            config,
            multiplexer,
            providers,
            ledger,
            tracker,
            clock,
            price_book,
            history_cache,
            spot_cache,
        }
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Latest known price for `symbol` plus a ticker subscription that keeps
    /// it fresh. The snapshot may be absent until the first ticker arrives.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` or `ShuttingDown`.
    pub fn get_realtime(&self, symbol: &Symbol) -> Result<RealtimeQuote, MarketDataError> {
        let subscription = self.subscribe(
            symbol,
            StreamKind::Ticker,
            super::multiplexer::callback(|_| {}),
        )?;
        Ok(RealtimeQuote {
            snapshot: self.price_book.latest(symbol),
            subscription,
        })
    }

    /// Subscribe to a stream for `symbol`.
    ///
    /// Ticker events also refresh the realtime price book.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` or `ShuttingDown`.
    pub fn subscribe(
        &self,
        symbol: &Symbol,
        kind: StreamKind,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, MarketDataError> {
        let key = ChannelKey::new(self.config.stream_provider, kind, symbol.clone());
        let callback = if kind == StreamKind::Ticker {
            let book = Arc::clone(&self.price_book);
            let inner = callback;
            Arc::new(move |message: ChannelMessage| {
                if let ChannelMessage::Event(event) = &message {
                    book.apply(event);
                }
                inner(message)
            }) as MessageCallback
        } else {
            callback
        };
        self.multiplexer.subscribe(key, callback)
    }

    /// Release a subscription. Idempotent.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.multiplexer.unsubscribe(handle);
    }

    /// Large-trade statistics for `symbol`, starting tracking on first use.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` or `ShuttingDown` if tracking cannot start.
    pub fn large_trades(&self, symbol: &Symbol) -> Result<TradeAggregate, MarketDataError> {
        self.tracker.track(symbol.clone())?;
        Ok(self.tracker.snapshot(symbol))
    }

    /// Status of every live channel.
    #[must_use]
    pub fn channel_states(&self) -> Vec<ChannelStatus> {
        self.multiplexer.channel_statuses()
    }

    // =========================================================================
    // REST
    // =========================================================================

    /// Historical price series, cached per symbol and range.
    ///
    /// # Errors
    ///
    /// - `UnsupportedSymbol` if no provider maps the symbol.
    /// - `QuotaExceeded` if every provider is over quota and nothing is cached.
    /// - The provider's error for any other failure, unless a stale entry can
    ///   be served.
    pub async fn get_historical(
        &self,
        symbol: &Symbol,
        range: HistoryRange,
    ) -> Result<CacheLookup<HistoricalSeries>, MarketDataError> {
        self.ensure_open()?;
        let routes = self.routes(symbol)?;
        let primary = routes
            .first()
            .map_or(self.config.stream_provider, |p| p.provider());
        let key = format!("history:{symbol}:{}", range.as_str());
        let ledger = Arc::clone(&self.ledger);
        let clock = Arc::clone(&self.clock);
        let symbol = symbol.clone();

        let result = self
            .history_cache
            .get_or_fetch(&key, self.config.history_ttl, move || {
                fetch_with_fallback(routes, ledger, clock, move |provider| {
                    let symbol = symbol.clone();
                    async move { provider.fetch_history(&symbol, range).await }.boxed()
                })
            })
            .await;
        self.record_request(&result, primary, |series| series.provider);
        result
    }

    /// Current spot price, cached with a short TTL.
    ///
    /// # Errors
    ///
    /// Same as [`DataFacade::get_historical`].
    pub async fn get_spot(
        &self,
        symbol: &Symbol,
    ) -> Result<CacheLookup<SpotPrice>, MarketDataError> {
        self.ensure_open()?;
        let routes = self.routes(symbol)?;
        let primary = routes
            .first()
            .map_or(self.config.stream_provider, |p| p.provider());
        let key = format!("spot:{symbol}");
        let ledger = Arc::clone(&self.ledger);
        let clock = Arc::clone(&self.clock);
        let symbol = symbol.clone();

        let result = self
            .spot_cache
            .get_or_fetch(&key, self.config.spot_ttl, move || {
                fetch_with_fallback(routes, ledger, clock, move |provider| {
                    let symbol = symbol.clone();
                    async move { provider.fetch_spot(&symbol).await }.boxed()
                })
            })
            .await;
        self.record_request(&result, primary, |spot| spot.provider);
        result
    }

    /// Per-provider quota snapshot.
    #[must_use]
    pub fn usage_report(&self) -> UsageReport {
        self.ledger.usage_report(self.clock.now())
    }

    /// Shared quota ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<RateLimitLedger> {
        &self.ledger
    }

    /// Shared large-trade tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<LargeTradeTracker> {
        &self.tracker
    }

    /// Attribute a finished request to the provider whose data answered it,
    /// or to the primary route when it failed.
    fn record_request<T>(
        &self,
        result: &Result<CacheLookup<T>, MarketDataError>,
        primary: Provider,
        provider_of: impl Fn(&T) -> Provider,
    ) {
        match result {
            Ok(lookup) => self
                .ledger
                .record_request(provider_of(&lookup.value), lookup.served_from_cache),
            Err(_) => self.ledger.record_request(primary, false),
        }
    }

    fn ensure_open(&self) -> Result<(), MarketDataError> {
        if self.multiplexer.is_shutting_down() {
            Err(MarketDataError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Providers, in fallback order, that can map `symbol`.
    fn routes(&self, symbol: &Symbol) -> Result<Vec<Arc<dyn RestProvider>>, MarketDataError> {
        let routes: Vec<Arc<dyn RestProvider>> = self
            .providers
            .iter()
            .filter(|provider| provider.check_symbol(symbol).is_ok())
            .cloned()
            .collect();
        if routes.is_empty() {
            let primary = self
                .providers
                .first()
                .map_or(self.config.stream_provider, |p| p.provider());
            return Err(MarketDataError::UnsupportedSymbol {
                provider: primary,
                symbol: symbol.to_string(),
            });
        }
        Ok(routes)
    }
}

/// Try each route in order. Quota refusals, from the ledger or from the
/// provider itself, move on to the next route; any other error ends the
/// attempt.
async fn fetch_with_fallback<T, F>(
    routes: Vec<Arc<dyn RestProvider>>,
    ledger: Arc<RateLimitLedger>,
    clock: Arc<dyn Clock>,
    call: F,
) -> Result<T, MarketDataError>
where
    T: Send,
    F: Fn(Arc<dyn RestProvider>) -> BoxFuture<'static, Result<T, MarketDataError>> + Send,
{
    let mut last_quota = None;

    for provider in routes {
        let id = provider.provider();
        let now = clock.now();

        if !ledger.try_consume(id, now) {
            tracing::info!(provider = id.as_str(), "Provider over quota, trying next provider");
            last_quota = Some(MarketDataError::QuotaExceeded {
                provider: id,
                retry_at: ledger.blocked_until(id, now),
            });
            continue;
        }

        let pressure = ledger.pressure_level(id, now);
        if pressure > PressureLevel::Ok {
            tracing::warn!(
                provider = id.as_str(),
                pressure = pressure.as_str(),
                "Provider quota pressure"
            );
        }

        match call(provider).await {
            Ok(value) => {
                metrics::record_provider_request(id, RequestOutcome::Success);
                return Ok(value);
            }
            Err(e) if e.is_quota() => {
                metrics::record_provider_request(id, RequestOutcome::QuotaExceeded);
                tracing::warn!(provider = id.as_str(), error = %e, "Provider refused with quota error");
                last_quota = Some(e);
            }
            Err(e) => {
                metrics::record_provider_request(id, RequestOutcome::Error);
                tracing::warn!(provider = id.as_str(), error = %e, "Provider request failed");
                return Err(e);
            }
        }
    }

    Err(last_quota
        .unwrap_or_else(|| MarketDataError::Internal("no provider route available".to_string())))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::ManualClock;
    use crate::application::services::multiplexer::MultiplexerConfig;
    use crate::application::services::tracker::TrackerConfig;
    use crate::domain::quota::QuotaPolicy;
    use crate::infrastructure::binance::BinanceStreamProvider;
    use crate::infrastructure::websocket::MemoryTransport;

    struct FixedProvider {
        provider: Provider,
        price: i64,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(provider: Provider, price: i64) -> Arc<Self> {
            Arc::new(Self {
                provider,
                price,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RestProvider for FixedProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn check_symbol(&self, symbol: &Symbol) -> Result<(), MarketDataError> {
            if symbol.base() == "BTC" {
                Ok(())
            } else {
                Err(MarketDataError::UnsupportedSymbol {
                    provider: self.provider,
                    symbol: symbol.to_string(),
                })
            }
        }

        async fn fetch_history(
            &self,
            symbol: &Symbol,
            range: HistoryRange,
        ) -> Result<HistoricalSeries, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HistoricalSeries {
                symbol: symbol.clone(),
                range,
                provider: self.provider,
                points: Vec::new(),
            })
        }

        async fn fetch_spot(&self, symbol: &Symbol) -> Result<SpotPrice, MarketDataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SpotPrice {
                symbol: symbol.clone(),
                provider: self.provider,
                price: Decimal::from(self.price),
                as_of: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            })
        }
    }

    fn facade(providers: Vec<Arc<dyn RestProvider>>, coingecko_per_minute: u32) -> DataFacade {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let mux = StreamMultiplexer::new(
            vec![Arc::new(BinanceStreamProvider::default())],
            Arc::new(MemoryTransport::new()),
            MultiplexerConfig::default(),
        );
        let ledger = Arc::new(RateLimitLedger::new(
            HashMap::from([(
                Provider::CoinGecko,
                QuotaPolicy {
                    per_minute: Some(coingecko_per_minute),
                    ..QuotaPolicy::default()
                },
            )]),
            FixedOffset::east_opt(0).unwrap(),
        ));
        let tracker = LargeTradeTracker::start(
            TrackerConfig::default(),
            mux.clone(),
            Provider::Binance,
            [],
        )
        .unwrap();
        DataFacade::new(FacadeConfig::default(), mux, providers, ledger, tracker, clock)
    }

    fn btc() -> Symbol {
        Symbol::parse("BTC-USD").unwrap()
    }

    #[tokio::test]
    async fn spot_is_cached() {
        let coingecko = FixedProvider::new(Provider::CoinGecko, 42_000);
        let facade = facade(vec![coingecko.clone() as Arc<dyn RestProvider>], 10);

        let first = facade.get_spot(&btc()).await.unwrap();
        let second = facade.get_spot(&btc()).await.unwrap();

        assert!(!first.served_from_cache);
        assert!(second.served_from_cache);
        assert_eq!(second.value.price, Decimal::from(42_000));
        assert_eq!(coingecko.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_when_primary_over_quota() {
        let coingecko = FixedProvider::new(Provider::CoinGecko, 1);
        let cryptocompare = FixedProvider::new(Provider::CryptoCompare, 2);
        let facade = facade(
            vec![
                coingecko.clone() as Arc<dyn RestProvider>,
                cryptocompare.clone() as Arc<dyn RestProvider>,
            ],
            0,
        );

        let series = facade.get_historical(&btc(), HistoryRange::Week).await.unwrap();

        assert_eq!(series.value.provider, Provider::CryptoCompare);
        assert_eq!(coingecko.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cryptocompare.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_providers_over_quota_surfaces_quota_error() {
        let coingecko = FixedProvider::new(Provider::CoinGecko, 1);
        let facade = facade(vec![coingecko as Arc<dyn RestProvider>], 0);

        let result = facade.get_spot(&btc()).await;

        assert!(matches!(
            result,
            Err(MarketDataError::QuotaExceeded {
                provider: Provider::CoinGecko,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unmapped_symbol_fails_fast() {
        let coingecko = FixedProvider::new(Provider::CoinGecko, 1);
        let facade = facade(vec![coingecko.clone() as Arc<dyn RestProvider>], 10);
        let doge = Symbol::parse("DOGE-USD").unwrap();

        let result = facade.get_historical(&doge, HistoryRange::Day).await;

        assert!(matches!(
            result,
            Err(MarketDataError::UnsupportedSymbol {
                provider: Provider::CoinGecko,
                ..
            })
        ));
        assert_eq!(coingecko.calls.load(Ordering::SeqCst), 0);
        assert_eq!(facade.usage_report().providers[1].windows[0].count, 0);
    }

    #[tokio::test]
    async fn realtime_without_ticker_has_no_snapshot() {
        let facade = facade(Vec::new(), 10);
        let quote = facade
            .get_realtime(&Symbol::parse("BTC-USDT").unwrap())
            .unwrap();

        assert!(quote.snapshot.is_none());
        assert!(quote.subscription.is_active());
        facade.unsubscribe(&quote.subscription);
        assert!(!quote.subscription.is_active());
    }
}
