//! Routing engine
//!
//! Orchestrates one selection:
//! 1. Apply the request's routing instructions
//! 2. Filter keys whose model series is cooling down, then per-key state
//! 3. Serve a sticky session binding, if one applies
//! 4. Walk the route's tiers in rank order (priority or SWRR per tier)
//! 5. Report `Exhausted` when every tier came up empty
//!
//! Configuration is published with replace-then-publish: a reload compiles a
//! new route table off to the side and swaps it in atomically. Quota, series
//! and sticky state survive a reload; round-robin credits do not.

use crate::config::{RoutingConfig, TierMode};
use crate::health::HealthWeightCalculator;
use crate::pool::{CompiledRoutes, RoutePoolTier};
use crate::priority::PrioritySelector;
use crate::quota::QuotaStateMachine;
use crate::series::{ModelSeriesCooldownGuard, SeriesGrouping};
use crate::sticky::{StickyOutcome, StickySessionSelector, StickySessionState};
use crate::strategy::{SmoothWeightedRoundRobin, starvation_bound};
use keyroute_core::{
    Error, ErrorClass, ExternalQuotaSnapshot, ProviderErrorEvent, ProviderKey,
    ProviderSuccessEvent, QuotaReason, QuotaSnapshot, QuotaStateEntry, Result,
    RoutingInstruction, SelectionContext, SharedClock, SystemClock, TargetSelector,
};
use keyroute_observability::RoutingMetrics;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Which stage of the pipeline produced a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Forced,
    Sticky,
    Priority,
    RoundRobin,
    /// Retry pick of the healthiest remaining key
    Recovery,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionSource::Forced => "forced",
            SelectionSource::Sticky => "sticky",
            SelectionSource::Priority => "priority",
            SelectionSource::RoundRobin => "round_robin",
            SelectionSource::Recovery => "recovery",
        }
    }
}

/// Result of a selection; exhaustion is a normal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum Selection {
    Selected {
        #[serde(rename = "providerKey")]
        provider_key: ProviderKey,
        source: SelectionSource,
    },
    Exhausted {
        exhausted: bool,
    },
}

impl Selection {
    fn exhausted() -> Self {
        Selection::Exhausted { exhausted: true }
    }

    pub fn key(&self) -> Option<&ProviderKey> {
        match self {
            Selection::Selected { provider_key, .. } => Some(provider_key),
            Selection::Exhausted { .. } => None,
        }
    }

    pub fn source(&self) -> Option<SelectionSource> {
        match self {
            Selection::Selected { source, .. } => Some(*source),
            Selection::Exhausted { .. } => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Selection::Exhausted { .. })
    }
}

/// What an error event did to the routing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutcome {
    pub class: ErrorClass,
    /// Reason of the key after the event
    pub reason: QuotaReason,
    pub retryable: bool,
    /// Series key and expiry, if a series cooldown started
    pub series_cooldown: Option<(String, i64)>,
    /// The failing key must be excluded from the immediate retry
    pub exclude_for_retry: bool,
}

/// Per-request instruction effects when no session is attached
#[derive(Debug, Default)]
struct RequestDirectives {
    force: Option<TargetSelector>,
    allowed: Option<HashSet<String>>,
    disabled: Vec<TargetSelector>,
}

impl RequestDirectives {
    fn permits(&self, key: &ProviderKey) -> bool {
        self.allowed
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&key.provider_id))
            && !self.disabled.iter().any(|target| target.matches(key))
    }
}

/// Immutable published configuration
#[derive(Debug, Default)]
struct Published {
    routes: CompiledRoutes,
    health: HealthWeightCalculator,
}

/// Routing engine owning all selection state
pub struct RoutingEngine {
    published: RwLock<Arc<Published>>,
    quota: QuotaStateMachine,
    priority: PrioritySelector,
    swrr: SmoothWeightedRoundRobin,
    series: ModelSeriesCooldownGuard,
    sticky: StickySessionSelector,
    clock: SharedClock,
    metrics: Option<Arc<RoutingMetrics>>,
}

impl RoutingEngine {
    /// Create an engine on the system clock
    pub fn new(config: RoutingConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine on an injected clock
    pub fn with_clock(config: RoutingConfig, clock: SharedClock) -> Result<Self> {
        let engine = Self {
            published: RwLock::new(Arc::new(Published::default())),
            quota: QuotaStateMachine::new(config.quota.clone()),
            priority: PrioritySelector::new(),
            swrr: SmoothWeightedRoundRobin::new(),
            series: ModelSeriesCooldownGuard::new(&config.series)?,
            sticky: StickySessionSelector::new(),
            clock,
            metrics: None,
        };
        engine.publish(config)?;
        Ok(engine)
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<RoutingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the series grouping with a custom function
    pub fn with_series_grouping(mut self, grouping: SeriesGrouping) -> Self {
        self.series.set_grouping(grouping);
        self
    }

    /// Validate, compile and atomically publish a new configuration
    pub fn publish(&self, config: RoutingConfig) -> Result<()> {
        let routes = CompiledRoutes::compile(&config)?;
        self.series.reconfigure(&config.series)?;
        self.quota.set_config(config.quota.clone());
        for (key, settings) in routes.settings() {
            self.quota.set_static(key, settings.limits, settings.priority_tier);
        }

        let route_count = routes.route_names().count();
        let key_count = routes.keys().len();
        let published = Arc::new(Published {
            routes,
            health: HealthWeightCalculator::new(&config.health),
        });
        {
            let mut guard = self
                .published
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = published;
        }
        self.swrr.reset();

        tracing::info!(routes = route_count, keys = key_count, "Routing configuration published");
        Ok(())
    }

    fn published(&self) -> Arc<Published> {
        self.published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Names of the published routes
    pub fn route_names(&self) -> Vec<String> {
        self.published()
            .routes
            .route_names()
            .map(str::to_string)
            .collect()
    }

    /// Select a key for one request on `route`
    ///
    /// Returns `Err` only for an unknown route.
    pub fn select(&self, route: &str, ctx: &SelectionContext) -> Result<Selection> {
        let published = self.published();
        let tiers = published
            .routes
            .tiers(route)
            .ok_or_else(|| Error::UnknownRoute(route.to_string()))?;
        let now = self.clock.now_ms();
        let session = ctx.session_key.as_deref();
        let recover = ctx.wants_recovery();

        let directives = self.apply_instructions(&published.routes, session, &ctx.instructions);

        // Series cooldown is checked before any per-key state
        let selectable = |key: &ProviderKey| {
            !ctx.excluded_provider_keys.contains(key)
                && directives.permits(key)
                && !self.series.is_cooling(key, now)
                && self.quota.is_selectable(key, now)
        };
        let weight = |key: &ProviderKey| published.health.weight_of(&self.quota.view(key, now), now);

        if let Some(target) = &directives.force {
            let forced = best_by_weight(
                published.routes.keys_matching(target).iter().filter(|key| selectable(*key)),
                &weight,
            );
            match forced {
                Some(key) => return Ok(self.selected(route, key, SelectionSource::Forced)),
                None => tracing::warn!(
                    route = %route,
                    provider = %target.provider_id,
                    model = ?target.model_id,
                    "Forced target not selectable, falling back to normal selection"
                ),
            }
        }

        if let Some(session) = session {
            let in_route = |key: &ProviderKey| published.routes.route_serves(route, key);
            match self.sticky.select(session, ctx.hint, in_route, &selectable, &weight, recover) {
                StickyOutcome::Selected(key) => {
                    return Ok(self.selected(route, key, SelectionSource::Sticky));
                }
                StickyOutcome::Cleared => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_sticky_auto_clear();
                    }
                }
                StickyOutcome::NotApplicable => {}
            }
        }

        let filter = session.and_then(|session| self.sticky.filter(session));
        let eligible = |key: &ProviderKey| {
            selectable(key) && filter.as_ref().is_none_or(|filter| filter.permits(key))
        };

        // Steer away from avoided single-account providers first
        let passes: &[bool] = if self.series.has_avoidance(now) {
            &[true, false]
        } else {
            &[false]
        };
        for &avoid in passes {
            let candidate = |key: &ProviderKey| {
                eligible(key) && !(avoid && self.series.avoids(&key.provider_id, now))
            };
            for tier in tiers {
                if let Some((key, source)) = self.select_in_tier(tier, &published, &candidate, &weight, recover, now) {
                    return Ok(self.selected(route, key, source));
                }
                tracing::debug!(route = %route, tier = %tier.id, "Tier exhausted");
            }
        }

        tracing::warn!(route = %route, session = ?session, "No selectable key on any tier");
        if let Some(metrics) = &self.metrics {
            metrics.record_exhausted(route);
        }
        Ok(Selection::exhausted())
    }

    fn select_in_tier<F, W>(
        &self,
        tier: &RoutePoolTier,
        published: &Published,
        candidate: F,
        weight: W,
        recover: bool,
        now: i64,
    ) -> Option<(ProviderKey, SelectionSource)>
    where
        F: Fn(&ProviderKey) -> bool,
        W: Fn(&ProviderKey) -> u32,
    {
        match tier.mode {
            TierMode::Priority => self
                .priority
                .select(&tier.targets, &candidate, |key| {
                    self.quota
                        .view(key, now)
                        .selection_penalty_at(now, tier.penalty_window_ms)
                })
                .map(|key| (key, SelectionSource::Priority)),
            TierMode::RoundRobin => {
                let available = tier.targets.iter().filter(|key| candidate(*key));
                if recover {
                    return best_by_weight(available, &weight)
                        .map(|key| (key, SelectionSource::Recovery));
                }

                let weighted: Vec<(ProviderKey, u32)> =
                    available.map(|key| (key.clone(), weight(key))).collect();
                let bound = starvation_bound(weighted.len(), published.health.min_multiplier());
                self.swrr
                    .select(&tier.id, &weighted, bound)
                    .map(|key| (key, SelectionSource::RoundRobin))
            }
        }
    }

    fn selected(&self, route: &str, key: ProviderKey, source: SelectionSource) -> Selection {
        tracing::debug!(
            route = %route,
            provider = %key.provider_id,
            alias = %key.key_alias,
            model = %key.model_id,
            source = source.as_str(),
            "Selected provider key"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_selection(route, &key.provider_id, &key.model_id, source.as_str());
        }
        Selection::Selected {
            provider_key: key,
            source,
        }
    }

    fn apply_instructions(
        &self,
        routes: &CompiledRoutes,
        session: Option<&str>,
        instructions: &[RoutingInstruction],
    ) -> RequestDirectives {
        let mut directives = RequestDirectives::default();

        for instruction in instructions {
            match (instruction, session) {
                (RoutingInstruction::Force { provider_id, model_id, key_alias }, _)
                | (RoutingInstruction::Sticky { provider_id, model_id, key_alias }, None) => {
                    directives.force = Some(TargetSelector {
                        provider_id: provider_id.clone(),
                        model_id: Some(model_id.clone()),
                        key_alias: key_alias.clone(),
                    });
                }
                (RoutingInstruction::Sticky { provider_id, model_id, key_alias }, Some(session)) => {
                    match key_alias {
                        Some(alias) => {
                            let key = ProviderKey::new(provider_id, alias, model_id);
                            if routes.contains(&key) {
                                self.sticky.set_sticky_key(session, key);
                            } else {
                                tracing::warn!(
                                    session = %session,
                                    key = %key,
                                    "Sticky key is not configured on any route, ignoring"
                                );
                            }
                        }
                        None => {
                            self.sticky.set_sticky_model(
                                session,
                                provider_id,
                                model_id,
                                routes.keys_for_model(provider_id, model_id),
                            );
                        }
                    }
                }
                (RoutingInstruction::Allow { providers }, Some(session)) => {
                    self.sticky.set_allowlist(session, providers.iter().cloned());
                }
                (RoutingInstruction::Allow { providers }, None) => {
                    directives.allowed = Some(providers.iter().cloned().collect());
                }
                (RoutingInstruction::Disable { target }, Some(session)) => {
                    self.sticky.set_disabled(session, target.clone());
                }
                (RoutingInstruction::Disable { target }, None) => {
                    directives.disabled.push(target.clone());
                }
                (RoutingInstruction::Enable { target }, Some(session)) => {
                    self.sticky.set_enabled(session, target);
                }
                (RoutingInstruction::Clear, Some(session)) => {
                    self.sticky.clear(session);
                }
                (RoutingInstruction::Enable { .. } | RoutingInstruction::Clear, None) => {
                    tracing::debug!("Session instruction without a session, ignoring");
                }
            }
        }
        directives
    }

    /// Record an upstream error
    ///
    /// `session` rotates the failing key inside that session's sticky queue.
    pub fn record_error(&self, event: &ProviderErrorEvent, session: Option<&str>) -> ErrorOutcome {
        let trip = self.series.on_error(event);
        let transition = self.quota.apply_error(event);

        if let Some(session) = session {
            self.sticky
                .on_failure(session, &event.provider_key, transition.reason.is_hard_block());
        }

        if let Some(metrics) = &self.metrics {
            let key = &event.provider_key;
            metrics.record_provider_error(&key.provider_id, &key.model_id, transition.class.as_str());
            metrics.update_key_state(&key.to_string(), transition.reason.as_str());
            if let Some(trip) = &trip {
                metrics.record_series_cooldown(&trip.series_key);
            }
        }

        ErrorOutcome {
            class: transition.class,
            reason: transition.reason,
            retryable: transition.class.is_retryable(),
            exclude_for_retry: trip.as_ref().is_some_and(|trip| trip.exclude_for_retry),
            series_cooldown: trip.map(|trip| (trip.series_key, trip.until_ms)),
        }
    }

    /// Record an upstream success
    pub fn record_success(&self, event: &ProviderSuccessEvent) -> QuotaReason {
        let reason = self.quota.apply_success(event);
        self.publish_key_state(&event.provider_key, reason);
        reason
    }

    /// Count one request and its tokens against the key's limits
    pub fn record_usage(&self, key: &ProviderKey, tokens: u64) -> QuotaReason {
        let reason = self.quota.apply_usage(key, tokens, self.clock.now_ms());
        self.publish_key_state(key, reason);
        reason
    }

    /// Merge a provider-reported quota snapshot
    pub fn merge_external_quota(&self, snapshot: &ExternalQuotaSnapshot) -> QuotaReason {
        let reason = self.quota.merge_external(snapshot, self.clock.now_ms());
        self.publish_key_state(&snapshot.provider_key, reason);
        reason
    }

    fn publish_key_state(&self, key: &ProviderKey, reason: QuotaReason) {
        if let Some(metrics) = &self.metrics {
            metrics.update_key_state(&key.to_string(), reason.as_str());
        }
    }

    /// Read-only quota state of a key
    pub fn quota_view(&self, key: &ProviderKey) -> QuotaStateEntry {
        self.quota.view(key, self.clock.now_ms())
    }

    /// Quota state of every known key, sorted by key
    pub fn quota_views(&self) -> Vec<(ProviderKey, QuotaStateEntry)> {
        self.quota.views(self.clock.now_ms())
    }

    /// Clear a key's error state, including a fatal blacklist
    pub fn reset_key(&self, key: &ProviderKey) -> bool {
        let reset = self.quota.reset(key, self.clock.now_ms());
        if reset {
            self.publish_key_state(key, QuotaReason::Ok);
        }
        reset
    }

    pub fn sticky_view(&self, session: &str) -> Option<StickySessionState> {
        self.sticky.view(session)
    }

    /// Series key a provider key belongs to
    pub fn series_key(&self, key: &ProviderKey) -> String {
        self.series.series_key(key)
    }

    /// Changes whenever persisted state changes
    pub fn revision(&self) -> u64 {
        self.quota.revision().wrapping_add(self.series.revision())
    }

    /// Versioned snapshot of quota and series state
    pub fn snapshot(&self) -> QuotaSnapshot {
        let now = self.clock.now_ms();
        let mut snapshot = QuotaSnapshot::new(now);
        for (key, entry) in self.quota.export() {
            snapshot.insert(&key, entry);
        }
        snapshot.series_cooldowns = self.series.active(now);
        snapshot
    }

    /// Load a persisted snapshot
    pub fn restore(&self, snapshot: &QuotaSnapshot) -> Result<()> {
        snapshot.check_version()?;
        let entries = snapshot.entries()?;
        let count = entries.len();

        self.quota.restore(entries);
        self.series.restore(&snapshot.series_cooldowns);

        tracing::info!(
            keys = count,
            series_cooldowns = snapshot.series_cooldowns.len(),
            updated_at = snapshot.updated_at,
            "Quota state restored"
        );
        Ok(())
    }
}

/// Highest-weight key; the earlier key wins ties
fn best_by_weight<'a, I, W>(keys: I, weight: W) -> Option<ProviderKey>
where
    I: IntoIterator<Item = &'a ProviderKey>,
    W: Fn(&ProviderKey) -> u32,
{
    let mut best: Option<(&ProviderKey, u32)> = None;
    for key in keys {
        let w = weight(key);
        match best {
            Some((_, best_weight)) if best_weight >= w => {}
            _ => best = Some((key, w)),
        }
    }
    best.map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyroute_core::{Clock, ManualClock};

    const START: i64 = 1_700_000_000_000;

    fn engine(yaml: &str) -> (RoutingEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let config = RoutingConfig::from_yaml(yaml).unwrap();
        let engine = RoutingEngine::with_clock(config, clock.clone()).unwrap();
        (engine, clock)
    }

    const TWO_PROVIDERS: &str = r#"
routes:
  default:
    tiers:
      - mode: priority
        targets:
          - { provider: a, model: m, aliases: [k1, k2] }
          - { provider: b, model: m, aliases: [k3] }
"#;

    #[test]
    fn test_unknown_route_is_error() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let err = engine.select("missing", &SelectionContext::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownRoute(name) if name == "missing"));
    }

    #[test]
    fn test_force_and_fallback() {
        let (engine, clock) = engine(TWO_PROVIDERS);
        let ctx = SelectionContext::new().with_instruction(RoutingInstruction::Force {
            provider_id: "b".to_string(),
            model_id: "m".to_string(),
            key_alias: None,
        });

        let selection = engine.select("default", &ctx).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k3");
        assert_eq!(selection.source(), Some(SelectionSource::Forced));

        engine.record_error(
            &ProviderErrorEvent::new(ProviderKey::new("b", "k3", "m"), clock.now_ms()).with_status(401),
            None,
        );
        let selection = engine.select("default", &ctx).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k1");
        assert_eq!(selection.source(), Some(SelectionSource::Priority));
    }

    #[test]
    fn test_sessionless_allow_and_disable() {
        let (engine, _) = engine(TWO_PROVIDERS);

        let ctx = SelectionContext::new().with_instruction(RoutingInstruction::Allow {
            providers: vec!["b".to_string()],
        });
        assert_eq!(engine.select("default", &ctx).unwrap().key().unwrap().key_alias, "k3");

        let ctx = SelectionContext::new().with_instruction(RoutingInstruction::Disable {
            target: TargetSelector::key(&ProviderKey::new("a", "k1", "m")),
        });
        assert_eq!(engine.select("default", &ctx).unwrap().key().unwrap().key_alias, "k2");

        // Nothing persists without a session
        let selection = engine.select("default", &SelectionContext::new()).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k1");
    }

    #[test]
    fn test_session_filters_persist() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let ctx = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Disable {
                target: TargetSelector::provider("a"),
            });
        assert_eq!(engine.select("default", &ctx).unwrap().key().unwrap().key_alias, "k3");

        let plain = SelectionContext::new().with_session("s");
        assert_eq!(engine.select("default", &plain).unwrap().key().unwrap().key_alias, "k3");

        let enable = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Enable {
                target: TargetSelector::provider("a"),
            });
        assert_eq!(engine.select("default", &enable).unwrap().key().unwrap().key_alias, "k1");
    }

    #[test]
    fn test_sticky_key_and_clear() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let ctx = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Sticky {
                provider_id: "b".to_string(),
                model_id: "m".to_string(),
                key_alias: Some("k3".to_string()),
            });

        let selection = engine.select("default", &ctx).unwrap();
        assert_eq!(selection.source(), Some(SelectionSource::Sticky));
        assert_eq!(selection.key().unwrap().key_alias, "k3");

        let clear = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Clear);
        let selection = engine.select("default", &clear).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k1");
        assert!(engine.sticky_view("s").is_none());
    }

    #[test]
    fn test_sticky_key_must_be_configured() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let ctx = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Sticky {
                provider_id: "ghost".to_string(),
                model_id: "nope".to_string(),
                key_alias: Some("x".to_string()),
            });

        let selection = engine.select("default", &ctx).unwrap();
        assert_eq!(selection.key().unwrap(), &ProviderKey::new("a", "k1", "m"));
        assert_eq!(selection.source(), Some(SelectionSource::Priority));
        assert!(engine.sticky_view("s").is_none());
    }

    #[test]
    fn test_sticky_binding_stays_on_its_route() {
        let (engine, _) = engine(
            r#"
routes:
  chat:
    tiers:
      - mode: priority
        targets:
          - { provider: a, model: m, aliases: [k1] }
  vision:
    tiers:
      - mode: priority
        targets:
          - { provider: v, model: m, aliases: [v1] }
"#,
        );
        let bind = SelectionContext::new()
            .with_session("s")
            .with_instruction(RoutingInstruction::Sticky {
                provider_id: "a".to_string(),
                model_id: "m".to_string(),
                key_alias: None,
            });
        let selection = engine.select("chat", &bind).unwrap();
        assert_eq!(selection.source(), Some(SelectionSource::Sticky));

        // The other route serves its own keys and the binding survives
        let plain = SelectionContext::new().with_session("s");
        let selection = engine.select("vision", &plain).unwrap();
        assert_eq!(selection.key().unwrap(), &ProviderKey::new("v", "v1", "m"));
        assert_eq!(selection.source(), Some(SelectionSource::Priority));

        let selection = engine.select("chat", &plain).unwrap();
        assert_eq!(selection.key().unwrap(), &ProviderKey::new("a", "k1", "m"));
        assert_eq!(selection.source(), Some(SelectionSource::Sticky));
    }

    #[test]
    fn test_exhausted_is_normal_value() {
        let (engine, clock) = engine(TWO_PROVIDERS);
        for alias in ["k1", "k2"] {
            engine.record_error(
                &ProviderErrorEvent::new(ProviderKey::new("a", alias, "m"), clock.now_ms()).with_status(403),
                None,
            );
        }
        let ctx = SelectionContext::new().retry_excluding(ProviderKey::new("b", "k3", "m"));

        let selection = engine.select("default", &ctx).unwrap();
        assert!(selection.is_exhausted());
        assert_eq!(serde_json::to_value(&selection).unwrap(), serde_json::json!({"exhausted": true}));
    }

    #[test]
    fn test_record_error_outcome() {
        let (engine, clock) = engine(TWO_PROVIDERS);
        let key = ProviderKey::new("a", "k1", "m");

        let outcome = engine.record_error(
            &ProviderErrorEvent::new(key.clone(), clock.now_ms())
                .with_status(429)
                .with_code("MODEL_CAPACITY_EXHAUSTED"),
            None,
        );
        assert_eq!(outcome.class, ErrorClass::RateLimited);
        assert_eq!(outcome.reason, QuotaReason::Cooldown);
        assert!(outcome.retryable);
        assert_eq!(outcome.series_cooldown, Some(("a.m".to_string(), START + 60_000)));
        assert!(!outcome.exclude_for_retry);

        // k2 shares the series even though it never failed
        let selection = engine.select("default", &SelectionContext::new()).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k3");
    }

    #[test]
    fn test_reset_key_lifts_fatal() {
        let (engine, clock) = engine(TWO_PROVIDERS);
        let key = ProviderKey::new("a", "k1", "m");
        engine.record_error(&ProviderErrorEvent::new(key.clone(), clock.now_ms()).with_status(401), None);
        engine.record_success(&ProviderSuccessEvent::new(key.clone(), clock.now_ms()));

        assert_eq!(engine.quota_view(&key).reason, QuotaReason::Fatal);
        assert!(engine.reset_key(&key));
        assert_eq!(engine.quota_view(&key).reason, QuotaReason::Ok);
    }

    #[test]
    fn test_publish_copies_static_limits() {
        let (engine, _) = engine(
            r#"
routes:
  default:
    tiers:
      - mode: priority
        targets:
          - { provider: a, model: m, aliases: [k1], limits: { rate_limit_per_minute: 1 }, priority_tier: 5 }
          - { provider: b, model: m, aliases: [k2] }
"#,
        );
        let k1 = ProviderKey::new("a", "k1", "m");
        assert_eq!(engine.quota_view(&k1).priority_tier, 5);

        engine.record_usage(&k1, 10);
        assert_eq!(engine.quota_view(&k1).reason, QuotaReason::QuotaDepleted);
        let selection = engine.select("default", &SelectionContext::new()).unwrap();
        assert_eq!(selection.key().unwrap().key_alias, "k2");
    }

    #[test]
    fn test_publish_rejects_invalid_config() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let err = engine.publish(RoutingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));

        // The previous configuration stays live
        assert!(engine.select("default", &SelectionContext::new()).is_ok());
    }

    #[test]
    fn test_metrics_recorded() {
        let (engine, _) = engine(TWO_PROVIDERS);
        let metrics = Arc::new(RoutingMetrics::new().unwrap());
        let engine = engine.with_metrics(metrics.clone());

        engine.select("default", &SelectionContext::new()).unwrap();
        assert_eq!(
            metrics
                .selections_total
                .with_label_values(&["default", "a", "m", "priority"])
                .get(),
            1.0
        );
    }
}
