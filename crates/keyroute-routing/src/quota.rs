//! Quota State Machine
//!
//! Authoritative per-key health and quota state. Error, success and usage
//! events mutate it; selection reads it.
//!
//! Retryable errors escalate through the cooldown schedule:
//! - 1st same-series error in the series window: cooldown step 1 (1 min)
//! - 2nd: step 2 (3 min)
//! - 3rd: step 3 (5 min) plus a blacklist (6 h)
//!
//! Fatal errors skip escalation and blacklist immediately with
//! `reason = fatal`. A success event never lifts a fatal blacklist.
//!
//! Entries live behind one mutex per key, so events for the same key apply in
//! receipt order while events for different keys never contend.

use crate::config::QuotaConfig;
use dashmap::DashMap;
use keyroute_core::{
    ErrorClass, ExternalQuotaSnapshot, KeyLimits, ProviderErrorEvent, ProviderKey,
    ProviderSuccessEvent, QuotaReason, QuotaStateEntry,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Result of applying one error event
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTransition {
    pub class: ErrorClass,
    /// Reason after the event
    pub reason: QuotaReason,
    pub series_error_count: u32,
    pub consecutive_error_count: u32,
    pub cooldown_until_ms: Option<i64>,
    pub blacklist_until_ms: Option<i64>,
}

type SharedEntry = Arc<Mutex<QuotaStateEntry>>;

/// Per-key quota and health state
#[derive(Debug)]
pub struct QuotaStateMachine {
    entries: DashMap<ProviderKey, SharedEntry>,
    config: RwLock<Arc<QuotaConfig>>,
    /// Bumped on every mutation; persistence flushes when it moves
    revision: AtomicU64,
}

impl QuotaStateMachine {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config: RwLock::new(Arc::new(config)),
            revision: AtomicU64::new(0),
        }
    }

    /// Replace the tuning parameters; existing state is kept
    pub fn set_config(&self, config: QuotaConfig) {
        let mut guard = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }

    pub fn config(&self) -> Arc<QuotaConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Get or lazily create the entry for a key
    fn entry(&self, key: &ProviderKey) -> SharedEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaStateEntry::default())))
            .clone()
    }

    fn existing(&self, key: &ProviderKey) -> Option<SharedEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Apply an upstream error
    ///
    /// Every event is recorded, including errors on keys that are already
    /// blocked. Windows only ever extend; a fatal blacklist is never
    /// downgraded by a later retryable error.
    pub fn apply_error(&self, event: &ProviderErrorEvent) -> ErrorTransition {
        let config = self.config();
        let class = event.class();
        let now = event.ts_ms;
        let shared = self.entry(&event.provider_key);
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        entry.refresh(now, config.usage_window_ms());

        let same_series = entry.last_error_series == Some(class)
            && entry
                .last_error_at_ms
                .is_some_and(|at| now.saturating_sub(at) <= config.series_window_ms());
        entry.series_error_count = if same_series {
            entry.series_error_count.saturating_add(1)
        } else {
            1
        };
        entry.consecutive_error_count = entry.consecutive_error_count.saturating_add(1);
        entry.selection_penalty = entry.consecutive_error_count;
        entry.last_error_at_ms = Some(now);
        entry.last_error_series = Some(class);

        if class == ErrorClass::Fatal {
            extend(&mut entry.blacklist_until_ms, now.saturating_add(config.fatal_blacklist_ms()));
            entry.fatal = true;
        } else {
            let step = config.cooldown_ms(entry.series_error_count);
            let retry_after = event.retry_after_ms.unwrap_or(0).max(0);
            extend(&mut entry.cooldown_until_ms, now.saturating_add(step.max(retry_after)));

            if entry.series_error_count >= config.blacklist_threshold {
                extend(&mut entry.blacklist_until_ms, now.saturating_add(config.blacklist_ms()));
            }
        }

        entry.updated_at_ms = now;
        entry.refresh(now, config.usage_window_ms());
        self.bump();

        match entry.reason {
            QuotaReason::Fatal | QuotaReason::Blacklist => tracing::warn!(
                key = %event.provider_key,
                class = %class,
                reason = %entry.reason,
                series_errors = entry.series_error_count,
                until_ms = ?entry.blacklist_until_ms,
                "Provider key blacklisted"
            ),
            QuotaReason::Cooldown => tracing::warn!(
                key = %event.provider_key,
                class = %class,
                series_errors = entry.series_error_count,
                until_ms = ?entry.cooldown_until_ms,
                "Provider key cooling down"
            ),
            _ => {}
        }

        ErrorTransition {
            class,
            reason: entry.reason,
            series_error_count: entry.series_error_count,
            consecutive_error_count: entry.consecutive_error_count,
            cooldown_until_ms: entry.cooldown_until_ms,
            blacklist_until_ms: entry.blacklist_until_ms,
        }
    }

    /// Apply an upstream success
    ///
    /// Zeroes the error counters and penalty. Active cooldown or blacklist
    /// windows run to their end; the key returns to the pool once they elapse.
    pub fn apply_success(&self, event: &ProviderSuccessEvent) -> QuotaReason {
        let config = self.config();
        let now = event.ts_ms;
        let shared = self.entry(&event.provider_key);
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let had_errors = entry.consecutive_error_count > 0;
        entry.consecutive_error_count = 0;
        entry.series_error_count = 0;
        entry.selection_penalty = 0;
        entry.last_error_series = None;
        entry.updated_at_ms = now;
        entry.refresh(now, config.usage_window_ms());
        self.bump();

        if had_errors {
            tracing::debug!(key = %event.provider_key, reason = %entry.reason, "Provider key recovered");
        }
        entry.reason
    }

    /// Count one request and its tokens against the key's limits
    pub fn apply_usage(&self, key: &ProviderKey, tokens: u64, now_ms: i64) -> QuotaReason {
        let config = self.config();
        let shared = self.entry(key);
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        entry.refresh(now_ms, config.usage_window_ms());
        if entry.window_started_at_ms.is_none() {
            entry.window_started_at_ms = Some(now_ms);
        }
        entry.window_requests = entry.window_requests.saturating_add(1);
        entry.window_tokens = entry.window_tokens.saturating_add(tokens);
        entry.total_tokens_used = entry.total_tokens_used.saturating_add(tokens);
        entry.updated_at_ms = now_ms;

        let was_ok = entry.reason == QuotaReason::Ok;
        entry.refresh(now_ms, config.usage_window_ms());
        self.bump();

        if was_ok && entry.reason == QuotaReason::QuotaDepleted {
            tracing::warn!(
                key = %key,
                requests = entry.window_requests,
                tokens = entry.window_tokens,
                total_tokens = entry.total_tokens_used,
                "Provider key quota depleted"
            );
        }
        entry.reason
    }

    /// Merge a provider-reported quota snapshot
    ///
    /// Only the external depletion window is touched; error-driven cooldowns
    /// and blacklists are left exactly as they are.
    pub fn merge_external(&self, snapshot: &ExternalQuotaSnapshot, now_ms: i64) -> QuotaReason {
        let config = self.config();
        let shared = self.entry(&snapshot.provider_key);
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let fraction = snapshot.remaining_fraction.clamp(0.0, 1.0);
        entry.external_remaining_fraction = Some(fraction);
        entry.external_depleted_until_ms = match snapshot.reset_at_ms {
            Some(reset_at) if fraction <= 0.0 && reset_at > now_ms => Some(reset_at),
            _ => None,
        };
        entry.updated_at_ms = now_ms;
        entry.refresh(now_ms, config.usage_window_ms());
        self.bump();

        entry.reason
    }

    /// Copy static limits and priority tier from configuration
    pub fn set_static(&self, key: &ProviderKey, limits: Option<KeyLimits>, priority_tier: Option<u32>) {
        let shared = self.entry(key);
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(limits) = limits {
            entry.limits = limits;
        }
        if let Some(tier) = priority_tier {
            entry.priority_tier = tier;
        }
        self.bump();
    }

    /// Read-only view of a key evaluated at `now_ms`
    ///
    /// Unknown keys report the default (healthy, unlimited) entry without
    /// being inserted.
    pub fn view(&self, key: &ProviderKey, now_ms: i64) -> QuotaStateEntry {
        let usage_window_ms = self.config().usage_window_ms();
        match self.existing(key) {
            Some(shared) => shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .evaluated(now_ms, usage_window_ms),
            None => QuotaStateEntry::default().evaluated(now_ms, usage_window_ms),
        }
    }

    /// True if the key's own state allows selection at `now_ms`
    pub fn is_selectable(&self, key: &ProviderKey, now_ms: i64) -> bool {
        self.view(key, now_ms).in_pool
    }

    /// All known entries evaluated at `now_ms`, sorted by key
    pub fn views(&self, now_ms: i64) -> Vec<(ProviderKey, QuotaStateEntry)> {
        let usage_window_ms = self.config().usage_window_ms();
        let shared: Vec<(ProviderKey, SharedEntry)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut views: Vec<_> = shared
            .into_iter()
            .map(|(key, entry)| {
                let entry = entry
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .evaluated(now_ms, usage_window_ms);
                (key, entry)
            })
            .collect();
        views.sort_by(|a, b| a.0.cmp(&b.0));
        views
    }

    /// Raw entries for persistence (windows are not re-evaluated)
    pub fn export(&self) -> Vec<(ProviderKey, QuotaStateEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item
                    .value()
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                (item.key().clone(), entry)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Replace the state of the given keys, e.g. from a persisted snapshot
    pub fn restore(&self, entries: impl IntoIterator<Item = (ProviderKey, QuotaStateEntry)>) {
        for (key, entry) in entries {
            self.entries.insert(key, Arc::new(Mutex::new(entry)));
        }
        self.bump();
    }

    /// Clear all error and usage state of a key, keeping its static settings
    ///
    /// This is the only way to lift a fatal blacklist before it expires.
    pub fn reset(&self, key: &ProviderKey, now_ms: i64) -> bool {
        let Some(shared) = self.existing(key) else {
            return false;
        };
        let mut entry = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        *entry = QuotaStateEntry {
            limits: entry.limits,
            priority_tier: entry.priority_tier,
            updated_at_ms: now_ms,
            ..Default::default()
        };
        self.bump();

        tracing::info!(key = %key, "Provider key state reset");
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QuotaStateMachine {
    fn default() -> Self {
        Self::new(QuotaConfig::default())
    }
}

fn extend(window: &mut Option<i64>, until_ms: i64) {
    *window = Some(window.map_or(until_ms, |current| current.max(until_ms)));
}
