//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for the routing engine:
//! - Selections by route, key and decision source
//! - Exhausted selections per route
//! - Upstream errors by provider, model and error class
//! - Currently blocked keys by reason
//! - Model-series cooldowns and sticky session auto-clears

use prometheus::{Counter, CounterVec, GaugeVec, Opts, Registry};
use std::sync::Arc;

/// Reasons a key can be blocked for, as reported by the quota state
pub const BLOCK_REASONS: [&str; 4] = ["cooldown", "blacklist", "fatal", "quotaDepleted"];

/// Metrics collector for the routing engine
#[derive(Clone)]
pub struct RoutingMetrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Successful selections
    pub selections_total: CounterVec,
    /// Selections that found no available key
    pub selection_exhausted_total: CounterVec,
    /// Upstream errors reported to the engine
    pub provider_errors_total: CounterVec,
    /// 1 while a key is blocked for the given reason
    pub key_blocked: GaugeVec,
    /// Model-series cooldowns started
    pub series_cooldowns_total: CounterVec,
    /// Sticky bindings cleared because no candidate was left
    pub sticky_auto_clears_total: Counter,
}

impl RoutingMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let selections_total = CounterVec::new(
            Opts::new("keyroute_selections_total", "Total number of key selections"),
            &["route", "provider", "model", "source"],
        )?;

        let selection_exhausted_total = CounterVec::new(
            Opts::new(
                "keyroute_selection_exhausted_total",
                "Selections where every tier was exhausted",
            ),
            &["route"],
        )?;

        let provider_errors_total = CounterVec::new(
            Opts::new(
                "keyroute_provider_errors_total",
                "Upstream errors by provider, model and error class",
            ),
            &["provider", "model", "class"],
        )?;

        let key_blocked = GaugeVec::new(
            Opts::new(
                "keyroute_key_blocked",
                "Whether a provider key is blocked (1) for the given reason",
            ),
            &["key", "reason"],
        )?;

        let series_cooldowns_total = CounterVec::new(
            Opts::new(
                "keyroute_series_cooldowns_total",
                "Model-series cooldowns triggered by capacity errors",
            ),
            &["series"],
        )?;

        let sticky_auto_clears_total = Counter::with_opts(Opts::new(
            "keyroute_sticky_auto_clears_total",
            "Sticky sessions cleared because their pool was exhausted",
        ))?;

        registry.register(Box::new(selections_total.clone()))?;
        registry.register(Box::new(selection_exhausted_total.clone()))?;
        registry.register(Box::new(provider_errors_total.clone()))?;
        registry.register(Box::new(key_blocked.clone()))?;
        registry.register(Box::new(series_cooldowns_total.clone()))?;
        registry.register(Box::new(sticky_auto_clears_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            selections_total,
            selection_exhausted_total,
            provider_errors_total,
            key_blocked,
            series_cooldowns_total,
            sticky_auto_clears_total,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful selection
    pub fn record_selection(&self, route: &str, provider: &str, model: &str, source: &str) {
        self.selections_total
            .with_label_values(&[route, provider, model, source])
            .inc();
    }

    /// Record an exhausted selection
    pub fn record_exhausted(&self, route: &str) {
        self.selection_exhausted_total
            .with_label_values(&[route])
            .inc();
    }

    /// Record an upstream error
    pub fn record_provider_error(&self, provider: &str, model: &str, class: &str) {
        self.provider_errors_total
            .with_label_values(&[provider, model, class])
            .inc();
    }

    /// Publish the current block reason of a key ("ok" clears all reasons)
    pub fn update_key_state(&self, key: &str, reason: &str) {
        for candidate in BLOCK_REASONS {
            let value = if candidate == reason { 1.0 } else { 0.0 };
            self.key_blocked
                .with_label_values(&[key, candidate])
                .set(value);
        }
    }

    /// Record a model-series cooldown
    pub fn record_series_cooldown(&self, series: &str) {
        self.series_cooldowns_total
            .with_label_values(&[series])
            .inc();
    }

    /// Record a sticky session auto-clear
    pub fn record_sticky_auto_clear(&self) {
        self.sticky_auto_clears_total.inc();
    }
}
