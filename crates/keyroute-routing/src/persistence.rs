//! Background persistence of quota state
//!
//! The engine never performs I/O. This wrapper loads the persisted snapshot
//! at startup and flushes the engine's state to a [`QuotaStore`] whenever its
//! revision moved. Flushing is best-effort: a failed flush is logged and
//! retried on the next tick.

use crate::engine::RoutingEngine;
use keyroute_core::{QuotaStore, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::interval;

/// Revision value that never matches a real revision
const NEVER_FLUSHED: u64 = u64::MAX;

/// Flushes engine snapshots to a quota store
pub struct QuotaPersistence {
    engine: Arc<RoutingEngine>,
    store: Arc<dyn QuotaStore>,
    last_flushed: AtomicU64,
    flush_interval: Duration,
}

impl QuotaPersistence {
    pub fn new(engine: Arc<RoutingEngine>, store: Arc<dyn QuotaStore>, flush_interval: Duration) -> Self {
        Self {
            engine,
            store,
            last_flushed: AtomicU64::new(NEVER_FLUSHED),
            flush_interval,
        }
    }

    /// Load the persisted snapshot into the engine
    ///
    /// Returns false when the store holds no snapshot yet.
    pub async fn restore(&self) -> Result<bool> {
        let Some(snapshot) = self.store.load().await? else {
            tracing::info!("No persisted quota state, starting fresh");
            return Ok(false);
        };

        self.engine.restore(&snapshot)?;
        self.last_flushed
            .store(self.engine.revision(), Ordering::Release);
        Ok(true)
    }

    /// Save a snapshot if the engine state changed since the last flush
    pub async fn flush(&self) -> Result<bool> {
        let revision = self.engine.revision();
        if self.last_flushed.load(Ordering::Acquire) == revision {
            return Ok(false);
        }

        let snapshot = self.engine.snapshot();
        self.store.save(&snapshot).await?;
        self.last_flushed.store(revision, Ordering::Release);

        tracing::debug!(
            revision,
            keys = snapshot.providers.len(),
            "Quota state flushed"
        );
        Ok(true)
    }

    /// Start the background flush task
    pub fn start_auto_flush(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let persistence = Arc::clone(&self);
        let interval_duration = self.flush_interval;

        tokio::spawn(async move {
            let mut ticker = interval(interval_duration);
            loop {
                ticker.tick().await;
                if let Err(e) = persistence.flush().await {
                    tracing::error!("Failed to persist quota state: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use async_trait::async_trait;
    use keyroute_core::{
        Error, ManualClock, ProviderErrorEvent, ProviderKey, QuotaReason, QuotaSnapshot,
    };
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait]
        impl QuotaStore for Store {
            async fn load(&self) -> Result<Option<QuotaSnapshot>>;
            async fn save(&self, snapshot: &QuotaSnapshot) -> Result<()>;
        }
    }

    const CONFIG: &str = r#"
routes:
  default:
    tiers:
      - mode: priority
        targets:
          - { provider: a, model: m, aliases: [k1, k2] }
"#;

    fn engine() -> Arc<RoutingEngine> {
        let config = RoutingConfig::from_yaml(CONFIG).unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        Arc::new(RoutingEngine::with_clock(config, clock).unwrap())
    }

    fn k1() -> ProviderKey {
        ProviderKey::new("a", "k1", "m")
    }

    #[tokio::test]
    async fn test_restore_empty_store() {
        let mut store = MockStore::new();
        store.expect_load().times(1).returning(|| Ok(None));

        let persistence = QuotaPersistence::new(engine(), Arc::new(store), Duration::from_secs(5));
        assert!(!persistence.restore().await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_applies_snapshot() {
        let source = engine();
        source.record_error(&ProviderErrorEvent::new(k1(), 1_000_000).with_status(401), None);
        let snapshot = source.snapshot();

        let mut store = MockStore::new();
        store
            .expect_load()
            .returning(move || Ok(Some(snapshot.clone())));

        let target = engine();
        let persistence = QuotaPersistence::new(target.clone(), Arc::new(store), Duration::from_secs(5));
        assert!(persistence.restore().await.unwrap());
        assert_eq!(target.quota_view(&k1()).reason, QuotaReason::Fatal);
    }

    #[tokio::test]
    async fn test_restore_rejects_newer_version() {
        let mut snapshot = QuotaSnapshot::new(0);
        snapshot.version = QuotaSnapshot::CURRENT_VERSION + 1;

        let mut store = MockStore::new();
        store
            .expect_load()
            .returning(move || Ok(Some(snapshot.clone())));

        let persistence = QuotaPersistence::new(engine(), Arc::new(store), Duration::from_secs(5));
        let err = persistence.restore().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSnapshotVersion { .. }));
    }

    #[tokio::test]
    async fn test_flush_only_when_changed() {
        let engine = engine();
        let mut store = MockStore::new();
        store
            .expect_save()
            .withf(|snapshot: &QuotaSnapshot| snapshot.version == QuotaSnapshot::CURRENT_VERSION)
            .times(2)
            .returning(|_| Ok(()));

        let persistence = QuotaPersistence::new(engine.clone(), Arc::new(store), Duration::from_secs(5));
        assert!(persistence.flush().await.unwrap());
        assert!(!persistence.flush().await.unwrap());

        engine.record_error(&ProviderErrorEvent::new(k1(), 1_000_000).with_status(500), None);
        assert!(persistence.flush().await.unwrap());
        assert!(!persistence.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let mut store = MockStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_save()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Storage("disk full".to_string())));
        store
            .expect_save()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let persistence = QuotaPersistence::new(engine(), Arc::new(store), Duration::from_secs(5));
        assert!(persistence.flush().await.is_err());
        assert!(persistence.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_flush_task() {
        let mut store = MockStore::new();
        store.expect_save().returning(|_| Ok(()));

        let persistence = Arc::new(QuotaPersistence::new(
            engine(),
            Arc::new(store),
            Duration::from_millis(10),
        ));
        let handle = persistence.clone().start_auto_flush();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(!persistence.flush().await.unwrap());
    }
}
