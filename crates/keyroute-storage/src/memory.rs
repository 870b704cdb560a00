//! In-memory quota store

use async_trait::async_trait;
use keyroute_core::{QuotaSnapshot, QuotaStore, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Keeps the latest snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    snapshot: RwLock<Option<QuotaSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing snapshot
    pub fn with_snapshot(snapshot: QuotaSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of snapshots saved so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn load(&self) -> Result<Option<QuotaSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &QuotaSnapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryQuotaStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save(&QuotaSnapshot::new(42)).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().updated_at, 42);
        assert_eq!(store.save_count(), 1);

        let seeded = MemoryQuotaStore::with_snapshot(QuotaSnapshot::new(7));
        assert_eq!(seeded.load().await.unwrap().unwrap().updated_at, 7);
    }
}
