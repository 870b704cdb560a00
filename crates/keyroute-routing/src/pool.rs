//! Compiled route pools
//!
//! A `RoutingConfig` is compiled once per publish into immutable
//! `CompiledRoutes`. Selection only ever reads a published `Arc` of it.

use crate::config::{ConfigError, RoutingConfig, TierMode, secs_to_ms};
use keyroute_core::{KeyLimits, ProviderKey, TargetSelector};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One tier of a route with its targets flattened in config order
#[derive(Debug, Clone)]
pub struct RoutePoolTier {
    /// Stable tier identity, `route#rank`; scopes round-robin credits
    pub id: String,
    pub mode: TierMode,
    pub rank: u32,
    pub targets: Vec<ProviderKey>,
    pub penalty_window_ms: i64,
}

/// Static per-key settings copied onto quota entries on publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySettings {
    pub limits: Option<KeyLimits>,
    pub priority_tier: Option<u32>,
}

/// Immutable, validated view of all routes
#[derive(Debug, Clone, Default)]
pub struct CompiledRoutes {
    routes: BTreeMap<String, Vec<RoutePoolTier>>,
    /// Every configured key, first occurrence order
    keys: Vec<ProviderKey>,
    /// Keys reachable through each route's tiers
    route_keys: HashMap<String, HashSet<ProviderKey>>,
    settings: HashMap<ProviderKey, KeySettings>,
}

impl CompiledRoutes {
    /// Validate and compile a configuration
    pub fn compile(config: &RoutingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let default_window_ms = secs_to_ms(config.priority.penalty_window_secs);
        let mut routes = BTreeMap::new();
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut route_keys: HashMap<String, HashSet<ProviderKey>> = HashMap::new();
        let mut settings: HashMap<ProviderKey, KeySettings> = HashMap::new();

        for (name, route) in &config.routes {
            let mut tiers: Vec<RoutePoolTier> = route
                .tiers
                .iter()
                .map(|tier| {
                    let mut targets = Vec::new();
                    for group in &tier.targets {
                        for alias in &group.aliases {
                            let key = ProviderKey::new(&group.provider, alias, &group.model);
                            if seen.insert(key.clone()) {
                                keys.push(key.clone());
                            }
                            if group.limits.is_some() || group.priority_tier.is_some() {
                                let entry = settings.entry(key.clone()).or_default();
                                entry.limits = group.limits.or(entry.limits);
                                entry.priority_tier = group.priority_tier.or(entry.priority_tier);
                            }
                            targets.push(key);
                        }
                    }

                    RoutePoolTier {
                        id: format!("{}#{}", name, tier.rank),
                        mode: tier.mode,
                        rank: tier.rank,
                        targets,
                        penalty_window_ms: tier
                            .penalty_window_secs
                            .map(secs_to_ms)
                            .unwrap_or(default_window_ms),
                    }
                })
                .collect();

            tiers.sort_by_key(|tier| tier.rank);
            let served = tiers
                .iter()
                .flat_map(|tier| tier.targets.iter().cloned())
                .collect();
            route_keys.insert(name.clone(), served);
            routes.insert(name.clone(), tiers);
        }

        Ok(Self {
            routes,
            keys,
            route_keys,
            settings,
        })
    }

    /// Tiers of a route in rank order
    pub fn tiers(&self, route: &str) -> Option<&[RoutePoolTier]> {
        self.routes.get(route).map(Vec::as_slice)
    }

    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Every configured key across all routes
    pub fn keys(&self) -> &[ProviderKey] {
        &self.keys
    }

    pub fn contains(&self, key: &ProviderKey) -> bool {
        self.keys.contains(key)
    }

    /// True if one of the route's tiers lists the key
    pub fn route_serves(&self, route: &str, key: &ProviderKey) -> bool {
        self.route_keys
            .get(route)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Union of keys for a provider and model across every route tier
    pub fn keys_for_model(&self, provider_id: &str, model_id: &str) -> Vec<ProviderKey> {
        self.keys
            .iter()
            .filter(|key| key.serves(provider_id, model_id))
            .cloned()
            .collect()
    }

    /// Configured keys covered by a selector
    pub fn keys_matching(&self, selector: &TargetSelector) -> Vec<ProviderKey> {
        self.keys
            .iter()
            .filter(|key| selector.matches(key))
            .cloned()
            .collect()
    }

    /// Static settings for keys that declare limits or a priority tier
    pub fn settings(&self) -> impl Iterator<Item = (&ProviderKey, &KeySettings)> {
        self.settings.iter()
    }
}
