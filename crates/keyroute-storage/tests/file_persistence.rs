//! Engine state survives a restart through the file store

use keyroute_core::{ManualClock, ProviderErrorEvent, ProviderKey, QuotaReason, SelectionContext};
use keyroute_routing::{QuotaPersistence, RoutingConfig, RoutingEngine};
use keyroute_storage::FileQuotaStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
routes:
  default:
    tiers:
      - mode: priority
        targets:
          - { provider: gemini, model: pro, aliases: [k1, k2] }
"#;

fn engine(now_ms: i64) -> Arc<RoutingEngine> {
    let config = RoutingConfig::from_yaml(CONFIG).unwrap();
    Arc::new(RoutingEngine::with_clock(config, Arc::new(ManualClock::new(now_ms))).unwrap())
}

#[tokio::test]
async fn test_blacklist_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("quota.json");
    let k1 = ProviderKey::new("gemini", "k1", "pro");

    let first = engine(1_000_000);
    let persistence = QuotaPersistence::new(
        first.clone(),
        Arc::new(FileQuotaStore::new(&path)),
        Duration::from_secs(5),
    );
    assert!(!persistence.restore().await.unwrap());

    first.record_error(&ProviderErrorEvent::new(k1.clone(), 1_000_000).with_status(401), None);
    assert!(persistence.flush().await.unwrap());
    assert!(path.exists());

    // Restart ten minutes later
    let second = engine(1_600_000);
    let persistence = QuotaPersistence::new(
        second.clone(),
        Arc::new(FileQuotaStore::new(&path)),
        Duration::from_secs(5),
    );
    assert!(persistence.restore().await.unwrap());

    assert_eq!(second.quota_view(&k1).reason, QuotaReason::Fatal);
    let selection = second.select("default", &SelectionContext::new()).unwrap();
    assert_eq!(selection.key().unwrap().key_alias, "k2");

    // Nothing changed since the restore
    assert!(!persistence.flush().await.unwrap());
}
