//! CoinGecko REST Adapter
//!
//! # Endpoints
//!
//! - History: `GET /coins/{id}/market_chart?vs_currency=usd&days=7`
//! - Spot: `GET /simple/price?ids=bitcoin&vs_currencies=usd`
//!
//! CoinGecko addresses assets by coin id, not ticker, so translation is an
//! explicit table. A base or quote outside the table is unsupported.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::http::JsonClient;
use crate::application::ports::RestProvider;
use crate::domain::market::{HistoricalSeries, HistoryRange, PricePoint, SpotPrice};
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;

/// Public API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

const COIN_IDS: [(&str, &str); 14] = [
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("SOL", "solana"),
    ("BNB", "binancecoin"),
    ("XRP", "ripple"),
    ("ADA", "cardano"),
    ("DOGE", "dogecoin"),
    ("DOT", "polkadot"),
    ("AVAX", "avalanche-2"),
    ("LINK", "chainlink"),
    ("MATIC", "matic-network"),
    ("LTC", "litecoin"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
];

const VS_CURRENCIES: [(&str, &str); 6] = [
    ("USD", "usd"),
    ("EUR", "eur"),
    ("GBP", "gbp"),
    ("JPY", "jpy"),
    ("BTC", "btc"),
    ("ETH", "eth"),
];

/// CoinGecko adapter settings.
#[derive(Clone)]
pub struct CoinGeckoConfig {
    /// API base URL.
    pub base_url: String,
    /// Demo or pro API key.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for CoinGeckoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinGeckoConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(i64, Decimal)>,
}

/// [`RestProvider`] for CoinGecko.
#[derive(Debug, Clone)]
pub struct CoinGeckoProvider {
    http: JsonClient,
}

impl CoinGeckoProvider {
    /// Create the adapter.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be built.
    pub fn new(config: &CoinGeckoConfig) -> Result<Self, MarketDataError> {
        let auth = config
            .api_key
            .as_ref()
            .filter(|key| !key.is_empty())
            .map(|key| (API_KEY_HEADER, key.clone()));
        Ok(Self {
            http: JsonClient::new(Provider::CoinGecko, &config.base_url, config.timeout, auth)?,
        })
    }

    /// Coin id and vs-currency for a symbol.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if either side is not in the tables.
    pub fn native(symbol: &Symbol) -> Result<(&'static str, &'static str), MarketDataError> {
        let coin = lookup(&COIN_IDS, symbol.base());
        let vs = lookup(&VS_CURRENCIES, symbol.quote());
        coin.zip(vs).ok_or_else(|| MarketDataError::UnsupportedSymbol {
            provider: Provider::CoinGecko,
            symbol: symbol.to_string(),
        })
    }
}

fn lookup(table: &[(&str, &'static str)], code: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(canonical, _)| *canonical == code)
        .map(|(_, native)| *native)
}

#[async_trait]
impl RestProvider for CoinGeckoProvider {
    fn provider(&self) -> Provider {
        Provider::CoinGecko
    }

    fn check_symbol(&self, symbol: &Symbol) -> Result<(), MarketDataError> {
        Self::native(symbol).map(|_| ())
    }

    async fn fetch_history(
        &self,
        symbol: &Symbol,
        range: HistoryRange,
    ) -> Result<HistoricalSeries, MarketDataError> {
        let (coin, vs) = Self::native(symbol)?;
        let chart: MarketChart = self
            .http
            .get(
                &format!("/coins/{coin}/market_chart"),
                &[
                    ("vs_currency", vs.to_string()),
                    ("days", range.days().to_string()),
                ],
            )
            .await?;

        let points = chart
            .prices
            .into_iter()
            .map(|(ms, price)| {
                DateTime::<Utc>::from_timestamp_millis(ms)
                    .map(|time| PricePoint { time, price })
                    .ok_or_else(|| {
                        MarketDataError::protocol(
                            Provider::CoinGecko.as_str(),
                            format!("timestamp out of range: {ms}"),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HistoricalSeries {
            symbol: symbol.clone(),
            range,
            provider: Provider::CoinGecko,
            points,
        })
    }

    async fn fetch_spot(&self, symbol: &Symbol) -> Result<SpotPrice, MarketDataError> {
        let (coin, vs) = Self::native(symbol)?;
        let prices: HashMap<String, HashMap<String, Decimal>> = self
            .http
            .get(
                "/simple/price",
                &[("ids", coin.to_string()), ("vs_currencies", vs.to_string())],
            )
            .await?;

        let price = prices
            .get(coin)
            .and_then(|quotes| quotes.get(vs))
            .copied()
            .ok_or_else(|| {
                MarketDataError::protocol(
                    Provider::CoinGecko.as_str(),
                    format!("no {vs} price for {coin}"),
                )
            })?;

        Ok(SpotPrice {
            symbol: symbol.clone(),
            provider: Provider::CoinGecko,
            price,
            as_of: Utc::now(),
        })
    }
}
