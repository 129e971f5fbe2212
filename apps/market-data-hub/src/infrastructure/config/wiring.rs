//! Dependency wiring from configuration.

use std::sync::Arc;

use super::settings::HubConfig;
use crate::application::ports::{RestProvider, SystemClock};
use crate::application::services::HubDependencies;
use crate::domain::symbol::Provider;
use crate::error::MarketDataError;
use crate::infrastructure::binance::BinanceStreamProvider;
use crate::infrastructure::persistence::JsonFileLedgerStore;
use crate::infrastructure::rest::{
    CoinGeckoConfig, CoinGeckoProvider, CryptoCompareConfig, CryptoCompareProvider,
};
use crate::infrastructure::websocket::WsTransport;

/// Build the production adapters: Binance over real WebSockets, the REST
/// providers in configured fallback order, and the JSON ledger file.
///
/// # Errors
///
/// Returns `Internal` if an HTTP client cannot be built.
pub fn build_dependencies(config: &HubConfig) -> Result<HubDependencies, MarketDataError> {
    let mut rest_providers: Vec<Arc<dyn RestProvider>> = Vec::new();
    for provider in &config.providers.fallback_order {
        match provider {
            Provider::CoinGecko => {
                rest_providers.push(Arc::new(CoinGeckoProvider::new(&CoinGeckoConfig {
                    base_url: config.providers.coingecko_url.clone(),
                    api_key: config
                        .providers
                        .coingecko_key
                        .as_ref()
                        .map(|key| key.expose().to_string()),
                    timeout: config.providers.http_timeout,
                })?));
            }
            Provider::CryptoCompare => {
                rest_providers.push(Arc::new(CryptoCompareProvider::new(
                    &CryptoCompareConfig {
                        base_url: config.providers.cryptocompare_url.clone(),
                        api_key: config
                            .providers
                            .cryptocompare_key
                            .as_ref()
                            .map(|key| key.expose().to_string()),
                        timeout: config.providers.http_timeout,
                    },
                )?));
            }
            Provider::Binance => {
                tracing::warn!("Binance has no REST adapter, skipping in fallback order");
            }
        }
    }

    Ok(HubDependencies {
        stream_providers: vec![Arc::new(BinanceStreamProvider::new(
            config.stream.binance_url.clone(),
        ))],
        transport: Arc::new(WsTransport::new(config.ws_transport())),
        rest_providers,
        ledger_store: Arc::new(JsonFileLedgerStore::new(config.ledger.path.clone())),
        clock: Arc::new(SystemClock),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_follow_fallback_order() {
        let mut config = HubConfig::default();
        config.providers.fallback_order = vec![Provider::CryptoCompare, Provider::CoinGecko];

        let deps = build_dependencies(&config).unwrap();
        let order: Vec<Provider> = deps.rest_providers.iter().map(|p| p.provider()).collect();
        assert_eq!(order, vec![Provider::CryptoCompare, Provider::CoinGecko]);
        assert_eq!(deps.stream_providers.len(), 1);
    }
}
