//! Shared JSON-over-HTTP client for REST providers.
//!
//! One GET per call, no retries. Retrying here would charge the rate-limit
//! ledger once but hit the provider several times; recovery belongs to the
//! facade's fallback chain and the response cache.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use crate::domain::symbol::Provider;
use crate::error::MarketDataError;

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// HTTP client bound to one provider's base URL and credentials.
#[derive(Clone)]
pub struct JsonClient {
    provider: Provider,
    client: Client,
    base_url: String,
    auth: Option<(&'static str, String)>,
}

impl std::fmt::Debug for JsonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl JsonClient {
    /// Build a client. `auth` is a header name and value sent on every call.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the TLS backend cannot be initialized.
    pub fn new(
        provider: Provider,
        base_url: &str,
        timeout: Duration,
        auth: Option<(&'static str, String)>,
    ) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketDataError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            provider,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// GET `path` with `query` and decode the body as `T`.
    ///
    /// # Errors
    ///
    /// - `QuotaExceeded` on HTTP 429
    /// - `Transport` on network failures, 408 and 5xx
    /// - `UpstreamRejected` on any other non-success status
    /// - `Protocol` if the body does not decode
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.get(&url).query(query);
        if let Some((name, value)) = &self.auth {
            request = request.header(*name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MarketDataError::transport(self.provider.as_str(), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| MarketDataError::transport(self.provider.as_str(), e.to_string()))?;
            return serde_json::from_str(&body).map_err(|e| {
                MarketDataError::protocol(self.provider.as_str(), format!("{path}: {e}"))
            });
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok());
        let body = response.text().await.unwrap_or_default();

        tracing::debug!(
            provider = self.provider.as_str(),
            path,
            status = status.as_u16(),
            "Provider returned error status"
        );

        Err(match categorize_status(status) {
            ErrorCategory::RateLimited => MarketDataError::QuotaExceeded {
                provider: self.provider,
                retry_at: retry_after.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            },
            ErrorCategory::Transient => {
                MarketDataError::transport(self.provider.as_str(), format!("HTTP {status}"))
            }
            ErrorCategory::Rejected => MarketDataError::UpstreamRejected {
                provider: self.provider,
                target: path.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&body)),
            },
        })
    }
}

enum ErrorCategory {
    RateLimited,
    Transient,
    Rejected,
}

const fn categorize_status(status: StatusCode) -> ErrorCategory {
    match status.as_u16() {
        429 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Rejected,
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
