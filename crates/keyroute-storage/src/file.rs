//! JSON file quota store

use crate::atomic_writer::AtomicWriter;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use keyroute_core::{QuotaSnapshot, QuotaStore, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Quota snapshots persisted as one pretty-printed JSON document
pub struct FileQuotaStore {
    path: PathBuf,
    /// Serializes writers so temp files never interleave
    write_lock: Mutex<()>,
}

impl FileQuotaStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_snapshot(&self) -> StorageResult<Option<QuotaSnapshot>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_str(&content).map_err(|e| StorageError::InvalidData {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    async fn write_snapshot(&self, snapshot: &QuotaSnapshot) -> StorageResult<()> {
        let content = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize quota state: {}", e)))?;

        let _guard = self.write_lock.lock().await;
        let mut writer = AtomicWriter::new(&self.path)?;
        writer.write(&content)?;
        writer.commit()?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for FileQuotaStore {
    async fn load(&self) -> Result<Option<QuotaSnapshot>> {
        let snapshot = self.read_snapshot().await?;
        if let Some(snapshot) = &snapshot {
            snapshot.check_version()?;
            tracing::debug!(
                path = %self.path.display(),
                keys = snapshot.providers.len(),
                "Loaded quota snapshot"
            );
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &QuotaSnapshot) -> Result<()> {
        self.write_snapshot(snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyroute_core::{Error, ProviderKey, QuotaReason, QuotaStateEntry};
    use tempfile::TempDir;

    fn snapshot() -> QuotaSnapshot {
        let mut snapshot = QuotaSnapshot::new(1_000);
        snapshot.insert(
            &ProviderKey::new("gemini", "k1", "pro"),
            QuotaStateEntry {
                in_pool: false,
                reason: QuotaReason::Cooldown,
                cooldown_until_ms: Some(61_000),
                consecutive_error_count: 1,
                ..Default::default()
            },
        );
        snapshot.series_cooldowns.insert("gemini.pro".to_string(), 61_000);
        snapshot
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileQuotaStore::new(temp_dir.path().join("quota.json"));

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileQuotaStore::new(temp_dir.path().join("state/quota.json"));

        store.save(&snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"gemini/k1/pro\""));
        assert!(raw.contains("\"cooldownUntilMs\""));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("quota.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileQuotaStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileQuotaStore::new(temp_dir.path().join("quota.json"));

        let mut future = snapshot();
        future.version = QuotaSnapshot::CURRENT_VERSION + 1;
        store.save(&future).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSnapshotVersion { found: 2, supported: 1 }));
    }
}
