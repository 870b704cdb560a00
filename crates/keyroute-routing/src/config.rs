//! Routing configuration
//!
//! The configuration is a plain serde model (YAML, TOML or JSON). Tuning
//! sections are optional and fall back to defaults; routes are required.
//! [`RoutingConfig::validate`] rejects malformed routes at load time so that
//! no configuration problem surfaces at request time.

use keyroute_core::KeyLimits;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No routes configured")]
    NoRoutes,

    #[error("Route '{0}' has no tiers")]
    EmptyRoute(String),

    #[error("Route '{route}' has more than one tier with rank {rank}")]
    DuplicateRank { route: String, rank: u32 },

    #[error("Tier {rank} of route '{route}' has no targets")]
    EmptyTier { route: String, rank: u32 },

    #[error("Target {provider}/{model} in route '{route}' has no aliases")]
    EmptyAliases {
        route: String,
        provider: String,
        model: String,
    },

    #[error("Key '{key}' appears more than once in tier {rank} of route '{route}'")]
    DuplicateKey { route: String, rank: u32, key: String },

    #[error("Invalid identifier '{0}': must be non-empty and must not contain '/'")]
    InvalidIdentifier(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid family pattern '{pattern}': {source}")]
    InvalidFamilyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for keyroute_core::Error {
    fn from(err: ConfigError) -> Self {
        keyroute_core::Error::ConfigValidation(err.to_string())
    }
}

/// Top-level routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub series: SeriesConfig,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

/// Cooldown/blacklist escalation and usage window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Cooldown per same-series error count (1st, 2nd, 3rd, ...)
    #[serde(default = "default_cooldown_schedule")]
    pub cooldown_schedule_secs: Vec<u64>,
    /// Same-series errors that trigger a blacklist
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    #[serde(default = "default_blacklist_secs")]
    pub blacklist_secs: u64,
    #[serde(default = "default_blacklist_secs")]
    pub fatal_blacklist_secs: u64,
    /// Errors further apart than this start a new series
    #[serde(default = "default_series_window")]
    pub series_window_secs: u64,
    /// Rolling window for per-minute request/token limits
    #[serde(default = "default_usage_window")]
    pub usage_window_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cooldown_schedule_secs: default_cooldown_schedule(),
            blacklist_threshold: default_blacklist_threshold(),
            blacklist_secs: default_blacklist_secs(),
            fatal_blacklist_secs: default_blacklist_secs(),
            series_window_secs: default_series_window(),
            usage_window_secs: default_usage_window(),
        }
    }
}

impl QuotaConfig {
    /// Cooldown for the `count`-th same-series error; the last step repeats
    pub fn cooldown_ms(&self, count: u32) -> i64 {
        let last = self.cooldown_schedule_secs.len().saturating_sub(1);
        let index = (count.max(1) as usize - 1).min(last);
        let secs = self.cooldown_schedule_secs.get(index).copied().unwrap_or(0);
        secs_to_ms(secs)
    }

    pub fn blacklist_ms(&self) -> i64 {
        secs_to_ms(self.blacklist_secs)
    }

    pub fn fatal_blacklist_ms(&self) -> i64 {
        secs_to_ms(self.fatal_blacklist_secs)
    }

    pub fn series_window_ms(&self) -> i64 {
        secs_to_ms(self.series_window_secs)
    }

    pub fn usage_window_ms(&self) -> i64 {
        secs_to_ms(self.usage_window_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cooldown_schedule_secs.is_empty() {
            return Err(invalid("quota.cooldown_schedule_secs", "must not be empty"));
        }
        if self.blacklist_threshold == 0 {
            return Err(invalid("quota.blacklist_threshold", "must be greater than 0"));
        }
        if self.series_window_secs == 0 {
            return Err(invalid("quota.series_window_secs", "must be greater than 0"));
        }
        if self.usage_window_secs == 0 {
            return Err(invalid("quota.usage_window_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Health weight decay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_base_weight")]
    pub base_weight: u32,
    #[serde(default = "default_half_life")]
    pub half_life_secs: u64,
    /// Multiplier lost per effective error
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Floor for the multiplier; keeps degraded keys reachable
    #[serde(default = "default_min_multiplier")]
    pub min_multiplier: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_weight: default_base_weight(),
            half_life_secs: default_half_life(),
            beta: default_beta(),
            min_multiplier: default_min_multiplier(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_weight == 0 {
            return Err(invalid("health.base_weight", "must be greater than 0"));
        }
        if self.half_life_secs == 0 {
            return Err(invalid("health.half_life_secs", "must be greater than 0"));
        }
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(invalid("health.beta", "must be a non-negative number"));
        }
        if !(self.min_multiplier > 0.0 && self.min_multiplier <= 1.0) {
            return Err(invalid("health.min_multiplier", "must be in (0.0, 1.0]"));
        }
        Ok(())
    }
}

/// Priority selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    /// How long an error keeps penalizing a key; tiers may override
    #[serde(default = "default_penalty_window")]
    pub penalty_window_secs: u64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            penalty_window_secs: default_penalty_window(),
        }
    }
}

/// Model-series cooldown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesConfig {
    #[serde(default = "default_series_cooldown")]
    pub cooldown_secs: u64,
    /// Error codes (case-insensitive substrings) marking a 429 as capacity exhaustion
    #[serde(default = "default_capacity_markers")]
    pub capacity_markers: Vec<String>,
    /// Ordered model family rules; first match wins, no match = `provider.model`
    #[serde(default)]
    pub families: Vec<FamilyRule>,
    /// Providers whose aliases share one upstream account
    #[serde(default)]
    pub single_account_providers: Vec<String>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_series_cooldown(),
            capacity_markers: default_capacity_markers(),
            families: Vec::new(),
            single_account_providers: Vec::new(),
        }
    }
}

/// Maps model IDs matching `pattern` to a shared family name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRule {
    /// Regex matched against the model ID
    pub pattern: String,
    pub family: String,
    /// Restrict the rule to one provider
    #[serde(default)]
    pub provider: Option<String>,
}

/// One named route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub tiers: Vec<TierConfig>,
}

/// Selection mode of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    Priority,
    RoundRobin,
}

impl TierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierMode::Priority => "priority",
            TierMode::RoundRobin => "round_robin",
        }
    }
}

/// Mode-tagged group of targets tried in rank order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub mode: TierMode,
    /// Lower ranks are tried first
    #[serde(default)]
    pub rank: u32,
    pub targets: Vec<TargetGroup>,
    #[serde(default)]
    pub penalty_window_secs: Option<u64>,
}

/// One provider/model with its key aliases, in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    pub provider: String,
    pub model: String,
    pub aliases: Vec<String>,
    #[serde(default)]
    pub limits: Option<KeyLimits>,
    #[serde(default)]
    pub priority_tier: Option<u32>,
}

impl RoutingConfig {
    /// Load a configuration file (YAML by default, TOML or JSON by extension)
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = expand_home(path.as_ref())?;
        let content = std::fs::read_to_string(&path)?;

        let config: RoutingConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("Invalid TOML: {}", e)))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("Invalid JSON: {}", e)))?,
            _ => serde_yaml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("Invalid YAML: {}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: RoutingConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section and route
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota.validate()?;
        self.health.validate()?;

        if self.priority.penalty_window_secs == 0 {
            return Err(invalid("priority.penalty_window_secs", "must be greater than 0"));
        }
        for rule in &self.series.families {
            Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidFamilyPattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
        }

        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        for (name, route) in &self.routes {
            validate_route(name, route)?;
        }
        Ok(())
    }
}

fn validate_route(name: &str, route: &RouteConfig) -> Result<(), ConfigError> {
    if route.tiers.is_empty() {
        return Err(ConfigError::EmptyRoute(name.to_string()));
    }

    let mut ranks = HashSet::new();
    for tier in &route.tiers {
        if !ranks.insert(tier.rank) {
            return Err(ConfigError::DuplicateRank {
                route: name.to_string(),
                rank: tier.rank,
            });
        }
        if tier.targets.is_empty() {
            return Err(ConfigError::EmptyTier {
                route: name.to_string(),
                rank: tier.rank,
            });
        }
        if tier.penalty_window_secs == Some(0) {
            return Err(invalid("tiers.penalty_window_secs", "must be greater than 0"));
        }

        let mut keys = HashSet::new();
        for group in &tier.targets {
            check_identifier(&group.provider)?;
            if group.model.is_empty() {
                return Err(ConfigError::InvalidIdentifier(group.model.clone()));
            }
            if group.aliases.is_empty() {
                return Err(ConfigError::EmptyAliases {
                    route: name.to_string(),
                    provider: group.provider.clone(),
                    model: group.model.clone(),
                });
            }
            for alias in &group.aliases {
                check_identifier(alias)?;
                if !keys.insert((group.provider.as_str(), alias.as_str(), group.model.as_str())) {
                    return Err(ConfigError::DuplicateKey {
                        route: name.to_string(),
                        rank: tier.rank,
                        key: format!("{}/{}/{}", group.provider, alias, group.model),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_identifier(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || id.contains('/') {
        return Err(ConfigError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn expand_home(path: &Path) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or_else(|| {
                ConfigError::Parse("Could not determine home directory".to_string())
            })?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

pub(crate) fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

fn default_cooldown_schedule() -> Vec<u64> {
    vec![60, 180, 300]
}

fn default_blacklist_threshold() -> u32 {
    3
}

fn default_blacklist_secs() -> u64 {
    6 * 60 * 60
}

fn default_series_window() -> u64 {
    600
}

fn default_usage_window() -> u64 {
    60
}

fn default_base_weight() -> u32 {
    100
}

fn default_half_life() -> u64 {
    600
}

fn default_beta() -> f64 {
    0.1
}

fn default_min_multiplier() -> f64 {
    0.5
}

fn default_penalty_window() -> u64 {
    600
}

fn default_series_cooldown() -> u64 {
    60
}

fn default_capacity_markers() -> Vec<String> {
    vec![
        "MODEL_CAPACITY_EXHAUSTED".to_string(),
        "RESOURCE_EXHAUSTED".to_string(),
        "overloaded".to_string(),
    ]
}
