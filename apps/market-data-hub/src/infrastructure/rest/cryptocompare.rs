//! CryptoCompare REST Adapter
//!
//! # Endpoints
//!
//! - History: `GET /data/v2/histohour` (1D, 7D) or `GET /data/v2/histoday`
//!   (30D, 90D, 1Y) with `fsym`, `tsym` and `limit`
//! - Spot: `GET /data/price?fsym=BTC&tsyms=USD`
//!
//! CryptoCompare reports most failures, rate limits included, as HTTP 200
//! with `"Response": "Error"`. Those bodies are classified before decoding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::http::JsonClient;
use crate::application::ports::RestProvider;
use crate::domain::market::{HistoricalSeries, HistoryRange, PricePoint, SpotPrice};
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;

/// Public API base URL.
pub const DEFAULT_BASE_URL: &str = "https://min-api.cryptocompare.com";

const QUOTES: [&str; 8] = ["USD", "USDT", "USDC", "EUR", "GBP", "JPY", "BTC", "ETH"];

/// CryptoCompare adapter settings.
#[derive(Clone)]
pub struct CryptoCompareConfig {
    /// API base URL.
    pub base_url: String,
    /// API key, sent as `authorization: Apikey <key>`.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for CryptoCompareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCompareConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for CryptoCompareConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(rename = "Data")]
    data: HistoryData,
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    #[serde(rename = "Data")]
    bars: Vec<HistoryBar>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    time: i64,
    close: Decimal,
}

/// Endpoint and bar count for a range.
const fn history_query(range: HistoryRange) -> (&'static str, u32) {
    match range {
        HistoryRange::Day => ("/data/v2/histohour", 24),
        HistoryRange::Week => ("/data/v2/histohour", 168),
        HistoryRange::Month | HistoryRange::Quarter | HistoryRange::Year => {
            ("/data/v2/histoday", range.days())
        }
    }
}

/// [`RestProvider`] for CryptoCompare.
#[derive(Debug, Clone)]
pub struct CryptoCompareProvider {
    http: JsonClient,
}

impl CryptoCompareProvider {
    /// Create the adapter.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be built.
    pub fn new(config: &CryptoCompareConfig) -> Result<Self, MarketDataError> {
        let auth = config
            .api_key
            .as_ref()
            .filter(|key| !key.is_empty())
            .map(|key| ("authorization", format!("Apikey {key}")));
        Ok(Self {
            http: JsonClient::new(
                Provider::CryptoCompare,
                &config.base_url,
                config.timeout,
                auth,
            )?,
        })
    }

    fn native(symbol: &Symbol) -> Result<(String, String), MarketDataError> {
        if QUOTES.contains(&symbol.quote()) {
            Ok((symbol.base().to_string(), symbol.quote().to_string()))
        } else {
            Err(MarketDataError::UnsupportedSymbol {
                provider: Provider::CryptoCompare,
                symbol: symbol.to_string(),
            })
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, MarketDataError> {
        let body: Value = self.http.get(path, query).await?;
        check_response(path, &body)?;
        Ok(body)
    }
}

/// Classify an in-band `"Response": "Error"` body.
fn check_response(path: &str, body: &Value) -> Result<(), MarketDataError> {
    if body.get("Response").and_then(Value::as_str) != Some("Error") {
        return Ok(());
    }
    let message = body
        .get("Message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    if message.to_lowercase().contains("rate limit") {
        Err(MarketDataError::QuotaExceeded {
            provider: Provider::CryptoCompare,
            retry_at: None,
        })
    } else {
        Err(MarketDataError::UpstreamRejected {
            provider: Provider::CryptoCompare,
            target: path.to_string(),
            reason: message.to_string(),
        })
    }
}

fn protocol(message: impl Into<String>) -> MarketDataError {
    MarketDataError::protocol(Provider::CryptoCompare.as_str(), message)
}

#[async_trait]
impl RestProvider for CryptoCompareProvider {
    fn provider(&self) -> Provider {
        Provider::CryptoCompare
    }

    fn check_symbol(&self, symbol: &Symbol) -> Result<(), MarketDataError> {
        Self::native(symbol).map(|_| ())
    }

    async fn fetch_history(
        &self,
        symbol: &Symbol,
        range: HistoryRange,
    ) -> Result<HistoricalSeries, MarketDataError> {
        let (fsym, tsym) = Self::native(symbol)?;
        let (path, limit) = history_query(range);
        let body = self
            .get(
                path,
                &[("fsym", fsym), ("tsym", tsym), ("limit", limit.to_string())],
            )
            .await?;

        let response: HistoryResponse =
            serde_json::from_value(body).map_err(|e| protocol(format!("{path}: {e}")))?;

        let points = response
            .data
            .bars
            .into_iter()
            .map(|bar| {
                DateTime::<Utc>::from_timestamp(bar.time, 0)
                    .map(|time| PricePoint {
                        time,
                        price: bar.close,
                    })
                    .ok_or_else(|| protocol(format!("timestamp out of range: {}", bar.time)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HistoricalSeries {
            symbol: symbol.clone(),
            range,
            provider: Provider::CryptoCompare,
            points,
        })
    }

    async fn fetch_spot(&self, symbol: &Symbol) -> Result<SpotPrice, MarketDataError> {
        let (fsym, tsym) = Self::native(symbol)?;
        let body = self
            .get("/data/price", &[("fsym", fsym), ("tsyms", tsym.clone())])
            .await?;

        let prices: HashMap<String, Decimal> =
            serde_json::from_value(body).map_err(|e| protocol(format!("/data/price: {e}")))?;
        let price = prices
            .get(&tsym)
            .copied()
            .ok_or_else(|| protocol(format!("no {tsym} price in response")))?;

        Ok(SpotPrice {
            symbol: symbol.clone(),
            provider: Provider::CryptoCompare,
            price,
            as_of: Utc::now(),
        })
    }
}
