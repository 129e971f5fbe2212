//! Market Data Hub
//!
//! Explicit registry for the hub's long-lived components. Built once at
//! process start with [`MarketDataHub::init`] and torn down with
//! [`MarketDataHub::shutdown`]; consumers receive the [`DataFacade`] by
//! reference.
//!
//! # Shutdown order
//!
//! 1. Trackers release their subscriptions.
//! 2. The multiplexer closes every connection and joins every worker.
//! 3. The ledger flusher stops after a final flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::FixedOffset;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::facade::{DataFacade, FacadeConfig};
use super::ledger::RateLimitLedger;
use super::multiplexer::{MultiplexerConfig, StreamMultiplexer};
use super::tracker::{LargeTradeTracker, TrackerConfig};
use crate::application::ports::{
    Clock, LedgerStore, RestProvider, StreamProvider, StreamTransport,
};
use crate::domain::quota::QuotaPolicy;
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;

/// Hub-wide settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Stream multiplexer timing.
    pub multiplexer: MultiplexerConfig,
    /// Facade caching and routing.
    pub facade: FacadeConfig,
    /// Large-trade thresholds and retention.
    pub tracker: TrackerConfig,
    /// Quota policy per provider. Missing providers are unmetered.
    pub quotas: HashMap<Provider, QuotaPolicy>,
    /// Offset used for daily and monthly quota resets.
    pub reset_offset: FixedOffset,
    /// Interval between ledger flushes.
    pub ledger_flush_interval: Duration,
    /// Symbols whose large trades are tracked from startup.
    pub watch_symbols: Vec<Symbol>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            facade: FacadeConfig::default(),
            tracker: TrackerConfig::default(),
            quotas: HashMap::new(),
            reset_offset: *chrono::Local::now().offset(),
            ledger_flush_interval: Duration::from_secs(30),
            watch_symbols: Vec::new(),
        }
    }
}

/// Adapters the hub is built from.
pub struct HubDependencies {
    /// Streaming protocol adapters.
    pub stream_providers: Vec<Arc<dyn StreamProvider>>,
    /// Physical stream transport.
    pub transport: Arc<dyn StreamTransport>,
    /// REST providers in fallback order.
    pub rest_providers: Vec<Arc<dyn RestProvider>>,
    /// Durable quota storage.
    pub ledger_store: Arc<dyn LedgerStore>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Registry owning the multiplexer, ledger, tracker and facade.
pub struct MarketDataHub {
    facade: Arc<DataFacade>,
    multiplexer: StreamMultiplexer,
    ledger: Arc<RateLimitLedger>,
    tracker: Arc<LargeTradeTracker>,
    ledger_store: Arc<dyn LedgerStore>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flusher_cancel: CancellationToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for MarketDataHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataHub")
            .field("facade", &self.facade)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MarketDataHub {
    /// Build every component, restore the ledger and start watching the
    /// configured symbols.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if a watched symbol cannot be streamed.
    pub async fn init(
        settings: HubSettings,
        deps: HubDependencies,
    ) -> Result<Self, MarketDataError> {
        let ledger = Arc::new(RateLimitLedger::new(settings.quotas, settings.reset_offset));
        ledger.load_from(deps.ledger_store.as_ref()).await;

        let flusher_cancel = CancellationToken::new();
        let flusher = ledger.spawn_flusher(
            Arc::clone(&deps.ledger_store),
            settings.ledger_flush_interval,
            flusher_cancel.clone(),
        );

        let multiplexer = StreamMultiplexer::new(
            deps.stream_providers,
            deps.transport,
            settings.multiplexer,
        );

        let tracker = match LargeTradeTracker::start(
            settings.tracker,
            multiplexer.clone(),
            settings.facade.stream_provider,
            settings.watch_symbols.iter().cloned(),
        ) {
            Ok(tracker) => tracker,
            Err(e) => {
                multiplexer.shutdown().await;
                flusher_cancel.cancel();
                let _ = flusher.await;
                return Err(e);
            }
        };

        let facade = Arc::new(DataFacade::new(
            settings.facade,
            multiplexer.clone(),
            deps.rest_providers,
            Arc::clone(&ledger),
            Arc::clone(&tracker),
            deps.clock,
        ));

        tracing::info!(
            watch_symbols = settings.watch_symbols.len(),
            "Market data hub initialized"
        );

        Ok(Self {
            facade,
            multiplexer,
            ledger,
            tracker,
            ledger_store: deps.ledger_store,
            flusher: Mutex::new(Some(flusher)),
            flusher_cancel,
            stopped: AtomicBool::new(false),
        })
    }

    /// The facade consumers call into.
    #[must_use]
    pub fn facade(&self) -> Arc<DataFacade> {
        Arc::clone(&self.facade)
    }

    /// Shut everything down. Only the first call has an effect.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Market data hub shutting down");

        self.tracker.stop();
        self.multiplexer.shutdown().await;

        self.flusher_cancel.cancel();
        let flusher = self.flusher.lock().take();
        match flusher {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Ledger flusher task failed");
                }
            }
            None => {
                if let Err(e) = self.ledger.flush(self.ledger_store.as_ref()).await {
                    tracing::error!(error = %e, "Final ledger flush failed");
                }
            }
        }

        tracing::info!("Market data hub stopped");
    }
}
