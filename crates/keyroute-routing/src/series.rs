//! Model-series cooldowns
//!
//! A capacity-exhausted 429 means the upstream model itself is saturated,
//! not just the credential that happened to hit it. The guard cools down the
//! whole series (`provider.model` by default, or a configured family) so
//! that sibling keys which never failed are skipped too. It is evaluated
//! before any per-key state.
//!
//! Providers whose aliases share one upstream account get one more rule: the
//! failing key is excluded from the immediate retry and selection is biased
//! away from that provider until the series cooldown ends.

use crate::config::{ConfigError, SeriesConfig, secs_to_ms};
use dashmap::DashMap;
use keyroute_core::{ProviderErrorEvent, ProviderKey};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Custom grouping from key to series key
pub type SeriesGrouping = Arc<dyn Fn(&ProviderKey) -> String + Send + Sync>;

#[derive(Debug)]
struct FamilyMatcher {
    provider: Option<String>,
    pattern: Regex,
    family: String,
}

struct SeriesSettings {
    cooldown_ms: i64,
    /// Lowercased capacity error markers
    markers: Vec<String>,
    families: Vec<FamilyMatcher>,
    single_account: HashSet<String>,
}

impl SeriesSettings {
    fn compile(config: &SeriesConfig) -> Result<Self, ConfigError> {
        let families = config
            .families
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|source| {
                    ConfigError::InvalidFamilyPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    }
                })?;
                Ok(FamilyMatcher {
                    provider: rule.provider.clone(),
                    pattern,
                    family: rule.family.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            cooldown_ms: secs_to_ms(config.cooldown_secs),
            markers: config
                .capacity_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            families,
            single_account: config.single_account_providers.iter().cloned().collect(),
        })
    }
}

/// What a capacity error did to the series state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesTrip {
    pub series_key: String,
    pub until_ms: i64,
    /// The failing key must not be retried immediately
    pub exclude_for_retry: bool,
}

/// Series-level cooldown filter
pub struct ModelSeriesCooldownGuard {
    settings: RwLock<Arc<SeriesSettings>>,
    grouping: Option<SeriesGrouping>,
    /// Series key to cooldown expiry
    cooldowns: DashMap<String, i64>,
    /// Single-account providers to steer away from, with expiry
    avoid: DashMap<String, i64>,
    revision: AtomicU64,
}

impl ModelSeriesCooldownGuard {
    pub fn new(config: &SeriesConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: RwLock::new(Arc::new(SeriesSettings::compile(config)?)),
            grouping: None,
            cooldowns: DashMap::new(),
            avoid: DashMap::new(),
            revision: AtomicU64::new(0),
        })
    }

    /// Replace the configured grouping with a custom function
    pub fn with_grouping(mut self, grouping: SeriesGrouping) -> Self {
        self.set_grouping(grouping);
        self
    }

    pub fn set_grouping(&mut self, grouping: SeriesGrouping) {
        self.grouping = Some(grouping);
    }

    /// Swap settings on config publish; active cooldowns are kept
    pub fn reconfigure(&self, config: &SeriesConfig) -> Result<(), ConfigError> {
        let compiled = Arc::new(SeriesSettings::compile(config)?);
        let mut guard = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = compiled;
        Ok(())
    }

    fn settings(&self) -> Arc<SeriesSettings> {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Series a key belongs to
    pub fn series_key(&self, key: &ProviderKey) -> String {
        if let Some(grouping) = &self.grouping {
            return grouping(key);
        }

        let settings = self.settings();
        let family = settings.families.iter().find(|rule| {
            rule.provider
                .as_ref()
                .is_none_or(|provider| *provider == key.provider_id)
                && rule.pattern.is_match(&key.model_id)
        });

        match family {
            Some(rule) => format!("{}.{}", key.provider_id, rule.family),
            None => format!("{}.{}", key.provider_id, key.model_id),
        }
    }

    /// True for a 429 whose error code carries a capacity marker
    pub fn is_capacity_error(&self, event: &ProviderErrorEvent) -> bool {
        if event.http_status != Some(429) {
            return false;
        }
        let Some(code) = event.error_code.as_deref() else {
            return false;
        };

        let code = code.to_lowercase();
        self.settings()
            .markers
            .iter()
            .any(|marker| code.contains(marker.as_str()))
    }

    /// Start a series cooldown if the event is a capacity error
    pub fn on_error(&self, event: &ProviderErrorEvent) -> Option<SeriesTrip> {
        if !self.is_capacity_error(event) {
            return None;
        }

        let settings = self.settings();
        let key = &event.provider_key;
        let series_key = self.series_key(key);
        let until_ms = event.ts_ms.saturating_add(settings.cooldown_ms);

        let until_ms = *self
            .cooldowns
            .entry(series_key.clone())
            .and_modify(|current| *current = (*current).max(until_ms))
            .or_insert(until_ms);

        let single_account = settings.single_account.contains(&key.provider_id);
        if single_account {
            self.avoid
                .entry(key.provider_id.clone())
                .and_modify(|current| *current = (*current).max(until_ms))
                .or_insert(until_ms);
        }
        self.revision.fetch_add(1, Ordering::AcqRel);

        tracing::warn!(
            series = %series_key,
            key = %key,
            until_ms,
            single_account,
            "Model series cooling down after capacity error"
        );

        Some(SeriesTrip {
            series_key,
            until_ms,
            exclude_for_retry: single_account,
        })
    }

    /// True while the key's series is cooling down
    pub fn is_cooling(&self, key: &ProviderKey, now_ms: i64) -> bool {
        let series_key = self.series_key(key);
        self.cooldowns
            .get(&series_key)
            .is_some_and(|until| *until > now_ms)
    }

    /// True while selection should prefer other providers over this one
    pub fn avoids(&self, provider_id: &str, now_ms: i64) -> bool {
        self.avoid
            .get(provider_id)
            .is_some_and(|until| *until > now_ms)
    }

    /// True if any provider is currently avoided
    pub fn has_avoidance(&self, now_ms: i64) -> bool {
        self.avoid.iter().any(|item| *item.value() > now_ms)
    }

    /// Active series cooldowns; expired ones are pruned
    pub fn active(&self, now_ms: i64) -> BTreeMap<String, i64> {
        self.cooldowns.retain(|_, until| *until > now_ms);
        self.avoid.retain(|_, until| *until > now_ms);
        self.cooldowns
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect()
    }

    /// Restore persisted series cooldowns
    pub fn restore(&self, cooldowns: &BTreeMap<String, i64>) {
        for (series, until) in cooldowns {
            self.cooldowns
                .entry(series.clone())
                .and_modify(|current| *current = (*current).max(*until))
                .or_insert(*until);
        }
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}
