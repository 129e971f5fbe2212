//! Rate Limit Ledger
//!
//! Per-provider call accounting against per-minute, daily and monthly
//! quotas.
//!
//! - `try_consume` either charges every configured window of a provider or
//!   charges nothing. A refusal leaves the ledger untouched.
//! - Windows roll lazily: a record whose `reset_at` has passed counts as
//!   zero on reads and is reopened by the next successful consume.
//! - `record_request` counts every facade request attributed to a provider,
//!   cache hits included. It never gates and is not persisted.
//! - State lives in memory and is flushed to a [`LedgerStore`] periodically
//!   and on shutdown. Persistence is advisory; a lost flush undercounts.
//!
//! Each provider has its own lock, so quota checks for different providers
//! never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{LedgerSnapshot, LedgerStore, LedgerStoreError};
use crate::domain::quota::{
    PressureLevel, QuotaPolicy, QuotaRecord, WindowKind, ledger_key, parse_ledger_key,
};
use crate::domain::symbol::Provider;
use crate::infrastructure::metrics;

// =============================================================================
// Usage Report
// =============================================================================

/// Usage of one quota window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    /// Window kind.
    pub window: WindowKind,
    /// Calls charged in the current window.
    pub count: u32,
    /// Configured limit.
    pub limit: u32,
    /// End of the current window, if one is open.
    pub reset_at: Option<DateTime<Utc>>,
    /// `count / limit` as a percentage.
    pub utilisation_pct: f64,
}

/// Facade requests attributed to one provider since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestUsage {
    /// Requests answered with the provider's data or on its behalf.
    pub total: u64,
    /// Of those, requests answered from the response cache.
    pub served_from_cache: u64,
}

#[derive(Debug, Default)]
struct RequestCounter {
    total: AtomicU64,
    served_from_cache: AtomicU64,
}

/// Usage of every configured window of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderUsage {
    /// Provider.
    pub provider: Provider,
    /// Highest pressure across the provider's windows.
    pub pressure: PressureLevel,
    /// Facade requests, including those that never reached the provider.
    pub requests: RequestUsage,
    /// Per-window usage. Empty for unmetered providers.
    pub windows: Vec<WindowUsage>,
}

/// Quota snapshot across all providers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    /// Time the report was taken.
    pub generated_at: DateTime<Utc>,
    /// One entry per provider.
    pub providers: Vec<ProviderUsage>,
}

// =============================================================================
// Ledger
// =============================================================================

type Account = BTreeMap<WindowKind, QuotaRecord>;

/// Quota ledger for all providers.
pub struct RateLimitLedger {
    policies: HashMap<Provider, QuotaPolicy>,
    accounts: HashMap<Provider, Mutex<Account>>,
    requests: HashMap<Provider, RequestCounter>,
    reset_offset: FixedOffset,
    dirty: AtomicBool,
}

impl std::fmt::Debug for RateLimitLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLedger")
            .field("policies", &self.policies)
            .field("reset_offset", &self.reset_offset)
            .finish_non_exhaustive()
    }
}

impl RateLimitLedger {
    /// Create an empty ledger.
    ///
    /// Providers missing from `policies` are unmetered. Daily and monthly
    /// windows reset at local midnight in `reset_offset`.
    #[must_use]
    pub fn new(policies: HashMap<Provider, QuotaPolicy>, reset_offset: FixedOffset) -> Self {
        let accounts = Provider::ALL
            .into_iter()
            .map(|provider| (provider, Mutex::new(Account::new())))
            .collect();
        let requests = Provider::ALL
            .into_iter()
            .map(|provider| (provider, RequestCounter::default()))
            .collect();
        Self {
            policies,
            accounts,
            requests,
            reset_offset,
            dirty: AtomicBool::new(false),
        }
    }

    /// Configured policy for a provider.
    #[must_use]
    pub fn policy(&self, provider: Provider) -> QuotaPolicy {
        self.policies.get(&provider).copied().unwrap_or_default()
    }

    /// Charge one call to every configured window of `provider`.
    ///
    /// Returns `false`, without charging anything, if any window is at its
    /// limit.
    pub fn try_consume(&self, provider: Provider, now: DateTime<Utc>) -> bool {
        let policy = self.policy(provider);
        if policy.is_unmetered() {
            return true;
        }
        let Some(account) = self.accounts.get(&provider) else {
            return true;
        };

        let mut records = account.lock();
        for (kind, limit) in policy.windows() {
            let count = records.get(&kind).map_or(0, |r| r.effective_count(now));
            if count >= limit {
                drop(records);
                metrics::record_quota_rejection(provider);
                tracing::debug!(
                    provider = provider.as_str(),
                    window = kind.as_str(),
                    count,
                    limit,
                    "Quota exhausted"
                );
                return false;
            }
        }

        for (kind, _) in policy.windows() {
            let record = records
                .entry(kind)
                .or_insert_with(|| QuotaRecord::open(kind, now, self.reset_offset));
            record.roll(kind, now, self.reset_offset);
            record.count = record.count.saturating_add(1);
        }
        drop(records);

        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Record one facade request answered for `provider`, whether or not it
    /// reached upstream. Does not touch quota windows.
    pub fn record_request(&self, provider: Provider, served_from_cache: bool) {
        if let Some(counter) = self.requests.get(&provider) {
            counter.total.fetch_add(1, Ordering::Relaxed);
            if served_from_cache {
                counter.served_from_cache.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Highest pressure level across the provider's windows. Pure read.
    #[must_use]
    pub fn pressure_level(&self, provider: Provider, now: DateTime<Utc>) -> PressureLevel {
        let policy = self.policy(provider);
        let Some(account) = self.accounts.get(&provider) else {
            return PressureLevel::Ok;
        };
        let records = account.lock();
        policy
            .windows()
            .map(|(kind, limit)| {
                let count = records.get(&kind).map_or(0, |r| r.effective_count(now));
                PressureLevel::classify(count, limit)
            })
            .max()
            .unwrap_or(PressureLevel::Ok)
    }

    /// Earliest time every exhausted window of `provider` has reset, or
    /// `None` if the provider is not blocked.
    #[must_use]
    pub fn blocked_until(&self, provider: Provider, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let policy = self.policy(provider);
        let account = self.accounts.get(&provider)?;
        let records = account.lock();
        policy
            .windows()
            .filter_map(|(kind, limit)| {
                let record = records.get(&kind)?;
                (record.effective_count(now) >= limit).then_some(record.reset_at)
            })
            .max()
    }

    /// Usage of every configured window of one provider.
    #[must_use]
    pub fn usage(&self, provider: Provider, now: DateTime<Utc>) -> ProviderUsage {
        let policy = self.policy(provider);
        let windows = self.accounts.get(&provider).map_or_else(Vec::new, |account| {
            let records = account.lock();
            policy
                .windows()
                .map(|(kind, limit)| {
                    let live = records.get(&kind).filter(|r| !r.is_expired(now));
                    let count = live.map_or(0, |r| r.count);
                    WindowUsage {
                        window: kind,
                        count,
                        limit,
                        reset_at: live.map(|r| r.reset_at),
                        utilisation_pct: utilisation(count, limit),
                    }
                })
                .collect()
        });

        ProviderUsage {
            provider,
            pressure: self.pressure_level(provider, now),
            requests: self.request_usage(provider),
            windows,
        }
    }

    /// Facade requests recorded for `provider` since startup.
    #[must_use]
    pub fn request_usage(&self, provider: Provider) -> RequestUsage {
        self.requests
            .get(&provider)
            .map_or_else(RequestUsage::default, |counter| RequestUsage {
                total: counter.total.load(Ordering::Relaxed),
                served_from_cache: counter.served_from_cache.load(Ordering::Relaxed),
            })
    }

    /// Usage across all providers.
    #[must_use]
    pub fn usage_report(&self, now: DateTime<Utc>) -> UsageReport {
        UsageReport {
            generated_at: now,
            providers: Provider::ALL
                .into_iter()
                .map(|provider| self.usage(provider, now))
                .collect(),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Persistable copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::new();
        for provider in Provider::ALL {
            if let Some(account) = self.accounts.get(&provider) {
                for (kind, record) in account.lock().iter() {
                    snapshot.insert(ledger_key(provider, *kind), *record);
                }
            }
        }
        snapshot
    }

    /// Replace in-memory state with a persisted snapshot.
    ///
    /// Unknown keys are skipped with a warning.
    pub fn restore(&self, snapshot: &LedgerSnapshot) {
        let mut restored: HashMap<Provider, Account> = HashMap::new();
        for (key, record) in snapshot {
            match parse_ledger_key(key) {
                Some((provider, kind)) => {
                    restored.entry(provider).or_default().insert(kind, *record);
                }
                None => tracing::warn!(key = %key, "Skipping unknown ledger entry"),
            }
        }

        for provider in Provider::ALL {
            if let Some(account) = self.accounts.get(&provider) {
                *account.lock() = restored.remove(&provider).unwrap_or_default();
            }
        }
        self.dirty.store(false, Ordering::Release);
    }

    /// Load persisted state. A failed load starts from an empty ledger.
    pub async fn load_from(&self, store: &dyn LedgerStore) {
        match store.load().await {
            Ok(snapshot) => {
                let entries = snapshot.len();
                self.restore(&snapshot);
                tracing::info!(entries, "Rate limit ledger restored");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load rate limit ledger, starting empty");
            }
        }
    }

    /// Write state to `store` if it changed since the last flush.
    ///
    /// Returns `true` if a write happened.
    ///
    /// # Errors
    ///
    /// Returns `LedgerStoreError` if the write fails; the ledger stays dirty
    /// so the next flush retries.
    pub async fn flush(&self, store: &dyn LedgerStore) -> Result<bool, LedgerStoreError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        if let Err(e) = store.save(&snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(entries = snapshot.len(), "Rate limit ledger flushed");
        Ok(true)
    }

    /// Flush every `interval` until `cancel` fires, then flush once more.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        store: Arc<dyn LedgerStore>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = ledger.flush(store.as_ref()).await {
                            tracing::warn!(error = %e, "Periodic ledger flush failed");
                        }
                    }
                }
            }

            if let Err(e) = ledger.flush(store.as_ref()).await {
                tracing::error!(error = %e, "Final ledger flush failed");
            }
        })
    }
}

fn utilisation(count: u32, limit: u32) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    (f64::from(count) / f64::from(limit) * 10_000.0).round() / 100.0
}
