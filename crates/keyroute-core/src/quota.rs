//! Per-key quota state and the persisted snapshot format
//!
//! `QuotaStateEntry` holds raw timestamps and counters. Availability
//! (`in_pool`, `reason`) is always derived from those timestamps at read time
//! through [`QuotaStateEntry::refresh`]; nothing sweeps entries in the
//! background.

use crate::error::{Error, Result};
use crate::events::ErrorClass;
use crate::key::ProviderKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default priority tier for keys without an explicit one
pub const DEFAULT_PRIORITY_TIER: u32 = 100;

/// Why a key is (or is not) in the selectable pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaReason {
    #[default]
    Ok,
    Cooldown,
    Blacklist,
    Fatal,
    QuotaDepleted,
}

impl QuotaReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaReason::Ok => "ok",
            QuotaReason::Cooldown => "cooldown",
            QuotaReason::Blacklist => "blacklist",
            QuotaReason::Fatal => "fatal",
            QuotaReason::QuotaDepleted => "quotaDepleted",
        }
    }

    /// Blacklisted or fatal: removed from sticky queues instead of rotated
    pub fn is_hard_block(&self) -> bool {
        matches!(self, QuotaReason::Blacklist | QuotaReason::Fatal)
    }
}

impl fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static quota limits for one key; `None` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyLimits {
    #[serde(default, alias = "rate_limit_per_minute", skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u64>,
    #[serde(default, alias = "token_limit_per_minute", skip_serializing_if = "Option::is_none")]
    pub token_limit_per_minute: Option<u64>,
    #[serde(default, alias = "total_token_limit", skip_serializing_if = "Option::is_none")]
    pub total_token_limit: Option<u64>,
}

impl KeyLimits {
    pub fn is_unlimited(&self) -> bool {
        self.rate_limit_per_minute.is_none()
            && self.token_limit_per_minute.is_none()
            && self.total_token_limit.is_none()
    }
}

fn default_in_pool() -> bool {
    true
}

fn default_priority_tier() -> u32 {
    DEFAULT_PRIORITY_TIER
}

/// Health and quota state of one provider key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStateEntry {
    #[serde(default = "default_in_pool")]
    pub in_pool: bool,
    #[serde(default)]
    pub reason: QuotaReason,
    #[serde(default = "default_priority_tier")]
    pub priority_tier: u32,

    #[serde(default)]
    pub cooldown_until_ms: Option<i64>,
    #[serde(default)]
    pub blacklist_until_ms: Option<i64>,
    /// The active blacklist came from a fatal error
    #[serde(default)]
    pub fatal: bool,

    /// Errors since the last success
    #[serde(default)]
    pub consecutive_error_count: u32,
    /// Same-series errors inside the series window
    #[serde(default)]
    pub series_error_count: u32,
    #[serde(default)]
    pub last_error_at_ms: Option<i64>,
    #[serde(default)]
    pub last_error_series: Option<ErrorClass>,
    #[serde(default)]
    pub selection_penalty: u32,

    #[serde(default)]
    pub limits: KeyLimits,
    #[serde(default)]
    pub window_started_at_ms: Option<i64>,
    #[serde(default)]
    pub window_requests: u64,
    #[serde(default)]
    pub window_tokens: u64,
    #[serde(default)]
    pub total_tokens_used: u64,

    #[serde(default)]
    pub external_remaining_fraction: Option<f64>,
    #[serde(default)]
    pub external_depleted_until_ms: Option<i64>,

    #[serde(default)]
    pub updated_at_ms: i64,
}

impl Default for QuotaStateEntry {
    fn default() -> Self {
        Self {
            in_pool: true,
            reason: QuotaReason::Ok,
            priority_tier: DEFAULT_PRIORITY_TIER,
            cooldown_until_ms: None,
            blacklist_until_ms: None,
            fatal: false,
            consecutive_error_count: 0,
            series_error_count: 0,
            last_error_at_ms: None,
            last_error_series: None,
            selection_penalty: 0,
            limits: KeyLimits::default(),
            window_started_at_ms: None,
            window_requests: 0,
            window_tokens: 0,
            total_tokens_used: 0,
            external_remaining_fraction: None,
            external_depleted_until_ms: None,
            updated_at_ms: 0,
        }
    }
}

fn active(until: Option<i64>, now_ms: i64) -> bool {
    until.is_some_and(|t| t > now_ms)
}

impl QuotaStateEntry {
    /// Drop elapsed windows and recompute `in_pool`/`reason` for `now_ms`
    ///
    /// Precedence when several blocks overlap: fatal, blacklist, cooldown,
    /// quota depletion.
    pub fn refresh(&mut self, now_ms: i64, usage_window_ms: i64) {
        if !active(self.cooldown_until_ms, now_ms) {
            self.cooldown_until_ms = None;
        }
        if !active(self.blacklist_until_ms, now_ms) {
            self.blacklist_until_ms = None;
            self.fatal = false;
        }
        if !active(self.external_depleted_until_ms, now_ms) {
            self.external_depleted_until_ms = None;
        }
        if self
            .window_started_at_ms
            .is_some_and(|started| started.saturating_add(usage_window_ms) <= now_ms)
        {
            self.window_started_at_ms = None;
            self.window_requests = 0;
            self.window_tokens = 0;
        }

        self.reason = if self.blacklist_until_ms.is_some() {
            if self.fatal {
                QuotaReason::Fatal
            } else {
                QuotaReason::Blacklist
            }
        } else if self.cooldown_until_ms.is_some() {
            QuotaReason::Cooldown
        } else if self.external_depleted_until_ms.is_some() || self.usage_depleted() {
            QuotaReason::QuotaDepleted
        } else {
            QuotaReason::Ok
        };
        self.in_pool = self.reason == QuotaReason::Ok;
    }

    /// Copy of this entry evaluated at `now_ms`
    pub fn evaluated(&self, now_ms: i64, usage_window_ms: i64) -> Self {
        let mut entry = self.clone();
        entry.refresh(now_ms, usage_window_ms);
        entry
    }

    /// True when a configured limit has been reached in the current window
    pub fn usage_depleted(&self) -> bool {
        self.limits
            .rate_limit_per_minute
            .is_some_and(|limit| self.window_requests >= limit)
            || self
                .limits
                .token_limit_per_minute
                .is_some_and(|limit| self.window_tokens >= limit)
            || self
                .limits
                .total_token_limit
                .is_some_and(|limit| self.total_tokens_used >= limit)
    }

    /// Penalty applied by priority selection: the stored penalty while the
    /// last error is within `window_ms`, otherwise 0
    pub fn selection_penalty_at(&self, now_ms: i64, window_ms: i64) -> u32 {
        match self.last_error_at_ms {
            Some(at) if now_ms.saturating_sub(at) < window_ms => self.selection_penalty,
            _ => 0,
        }
    }

    /// Earliest time the key can return to the pool, if it is blocked
    pub fn blocked_until_ms(&self, usage_window_ms: i64) -> Option<i64> {
        let total_spent = self
            .limits
            .total_token_limit
            .is_some_and(|limit| self.total_tokens_used >= limit);
        let usage_until = if total_spent {
            Some(i64::MAX)
        } else if self.usage_depleted() {
            self.window_started_at_ms.map(|s| s.saturating_add(usage_window_ms))
        } else {
            None
        };

        [
            self.blacklist_until_ms,
            self.cooldown_until_ms,
            self.external_depleted_until_ms,
            usage_until,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// Versioned snapshot of all quota state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub version: u32,
    /// Unix ms at which the snapshot was taken
    pub updated_at: i64,
    /// Entries keyed by `provider/alias/model`
    pub providers: BTreeMap<String, QuotaStateEntry>,
    /// Active model-series cooldowns: series key to expiry (Unix ms)
    #[serde(default)]
    pub series_cooldowns: BTreeMap<String, i64>,
}

impl QuotaSnapshot {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(updated_at: i64) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            updated_at,
            providers: BTreeMap::new(),
            series_cooldowns: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: &ProviderKey, entry: QuotaStateEntry) {
        self.providers.insert(key.to_string(), entry);
    }

    /// Reject snapshots written by a newer format
    pub fn check_version(&self) -> Result<()> {
        if self.version > Self::CURRENT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion {
                found: self.version,
                supported: Self::CURRENT_VERSION,
            });
        }
        Ok(())
    }

    /// Entries with parsed keys
    pub fn entries(&self) -> Result<Vec<(ProviderKey, QuotaStateEntry)>> {
        self.providers
            .iter()
            .map(|(key, entry)| Ok((key.parse::<ProviderKey>()?, entry.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 60_000;

    #[test]
    fn test_default_entry() {
        let entry = QuotaStateEntry::default();
        assert!(entry.in_pool);
        assert_eq!(entry.reason, QuotaReason::Ok);
        assert_eq!(entry.priority_tier, 100);
        assert!(entry.limits.is_unlimited());
    }

    #[test]
    fn test_refresh_expires_windows() {
        let mut entry = QuotaStateEntry {
            cooldown_until_ms: Some(2_000),
            ..Default::default()
        };

        entry.refresh(1_000, WINDOW);
        assert!(!entry.in_pool);
        assert_eq!(entry.reason, QuotaReason::Cooldown);

        entry.refresh(2_000, WINDOW);
        assert!(entry.in_pool);
        assert_eq!(entry.reason, QuotaReason::Ok);
        assert_eq!(entry.cooldown_until_ms, None);
    }

    #[test]
    fn test_refresh_precedence() {
        let mut entry = QuotaStateEntry {
            cooldown_until_ms: Some(10_000),
            blacklist_until_ms: Some(20_000),
            fatal: true,
            ..Default::default()
        };
        entry.refresh(0, WINDOW);
        assert_eq!(entry.reason, QuotaReason::Fatal);

        entry.refresh(20_000, WINDOW);
        assert_eq!(entry.reason, QuotaReason::Ok);
        assert!(!entry.fatal);

        let mut entry = QuotaStateEntry {
            cooldown_until_ms: Some(10_000),
            external_depleted_until_ms: Some(30_000),
            ..Default::default()
        };
        entry.refresh(0, WINDOW);
        assert_eq!(entry.reason, QuotaReason::Cooldown);
        entry.refresh(10_000, WINDOW);
        assert_eq!(entry.reason, QuotaReason::QuotaDepleted);
    }

    #[test]
    fn test_usage_window_rollover() {
        let mut entry = QuotaStateEntry {
            limits: KeyLimits {
                rate_limit_per_minute: Some(2),
                ..Default::default()
            },
            window_started_at_ms: Some(0),
            window_requests: 2,
            ..Default::default()
        };

        entry.refresh(30_000, WINDOW);
        assert_eq!(entry.reason, QuotaReason::QuotaDepleted);
        assert_eq!(entry.blocked_until_ms(WINDOW), Some(60_000));

        entry.refresh(60_000, WINDOW);
        assert_eq!(entry.reason, QuotaReason::Ok);
        assert_eq!(entry.window_requests, 0);
    }

    #[test]
    fn test_selection_penalty_window() {
        let entry = QuotaStateEntry {
            selection_penalty: 2,
            last_error_at_ms: Some(1_000),
            ..Default::default()
        };
        assert_eq!(entry.selection_penalty_at(1_000, 600_000), 2);
        assert_eq!(entry.selection_penalty_at(600_999, 600_000), 2);
        assert_eq!(entry.selection_penalty_at(601_000, 600_000), 0);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = QuotaSnapshot::new(5);
        snapshot.insert(&ProviderKey::new("p", "a", "m"), QuotaStateEntry::default());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["updatedAt"], 5);
        assert_eq!(json["providers"]["p/a/m"]["inPool"], true);
        assert_eq!(json["providers"]["p/a/m"]["priorityTier"], 100);

        let entries = snapshot.entries().unwrap();
        assert_eq!(entries[0].0, ProviderKey::new("p", "a", "m"));
    }

    #[test]
    fn test_snapshot_missing_series_cooldowns() {
        let json = r#"{"version":1,"updatedAt":0,"providers":{}}"#;
        let snapshot: QuotaSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.series_cooldowns.is_empty());
        assert!(snapshot.check_version().is_ok());
    }

    #[test]
    fn test_snapshot_rejects_newer_version() {
        let mut snapshot = QuotaSnapshot::new(0);
        snapshot.version = 2;
        assert!(matches!(
            snapshot.check_version(),
            Err(Error::UnsupportedSnapshotVersion { found: 2, supported: 1 })
        ));
    }
}
