//! Ledger Persistence
//!
//! [`JsonFileLedgerStore`] keeps the rate-limit ledger in one JSON file:
//!
//! ```json
//! {"coingecko:per_minute": {"count": 3, "reset_at": "2026-01-01T00:01:00Z"}}
//! ```
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::application::ports::{LedgerSnapshot, LedgerStore, LedgerStoreError};

/// File-backed [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    /// Store the ledger at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl LedgerStore for JsonFileLedgerStore {
    async fn load(&self) -> Result<LedgerSnapshot, LedgerStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No ledger file, starting empty");
                return Ok(LedgerSnapshot::new());
            }
            Err(e) => return Err(LedgerStoreError::Io(e.to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LedgerSnapshot::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| LedgerStoreError::Corrupt(e.to_string()))
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerStoreError> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| LedgerStoreError::Corrupt(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerStoreError::Io(e.to_string()))?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| LedgerStoreError::Io(e.to_string()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| LedgerStoreError::Io(e.to_string()))?;

        tracing::trace!(path = %self.path.display(), entries = snapshot.len(), "Ledger saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::domain::quota::QuotaRecord;

    fn snapshot() -> LedgerSnapshot {
        let reset_at = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        let record = QuotaRecord { count: 3, reset_at };
        LedgerSnapshot::from([("coingecko:per_minute".to_string(), record)])
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLedgerStore::new(dir.path().join("ledger.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLedgerStore::new(dir.path().join("nested/ledger.json"));

        store.save(&snapshot()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), snapshot());
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileLedgerStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(LedgerStoreError::Corrupt(_))
        ));
    }
}
