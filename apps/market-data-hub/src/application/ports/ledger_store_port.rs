//! Ledger Store Port (Driven Port)
//!
//! Durable storage for quota counters. The format is an opaque map from
//! `provider:window` to `(count, reset_at)`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::quota::QuotaRecord;

/// Persisted ledger state.
pub type LedgerSnapshot = BTreeMap<String, QuotaRecord>;

/// Ledger persistence errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerStoreError {
    /// Storage could not be read or written.
    #[error("ledger storage I/O failed: {0}")]
    Io(String),

    /// Stored data could not be decoded.
    #[error("ledger storage is corrupt: {0}")]
    Corrupt(String),
}

/// Durable store for quota counters.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the last saved snapshot. A missing store yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns `LedgerStoreError` if the store exists but cannot be read.
    async fn load(&self) -> Result<LedgerSnapshot, LedgerStoreError>;

    /// Replace the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns `LedgerStoreError` if the snapshot cannot be written.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError>;
}

/// In-memory ledger store for tests.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    snapshot: Mutex<LedgerSnapshot>,
    saves: Mutex<u64>,
}

impl InMemoryLedgerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            saves: Mutex::new(0),
        }
    }

    /// Current stored snapshot.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.snapshot.lock().clone()
    }

    /// Number of completed saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load(&self) -> Result<LedgerSnapshot, LedgerStoreError> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError> {
        *self.snapshot.lock() = snapshot.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}
