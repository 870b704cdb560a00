//! KeyRoute Routing Engine
//!
//! This crate provides the key selection logic for KeyRoute:
//! - Route configuration, validation and compilation
//! - Quota state machine (cooldown, blacklist, usage limits)
//! - Health weights, priority selection and smooth weighted round-robin
//! - Model-series cooldowns and sticky sessions
//! - The routing engine and its background persistence

pub mod config;
pub mod engine;
pub mod health;
pub mod persistence;
pub mod pool;
pub mod priority;
pub mod quota;
pub mod series;
pub mod sticky;
pub mod strategy;

// Re-export commonly used types
pub use config::{
    ConfigError, FamilyRule, HealthConfig, PriorityConfig, QuotaConfig, RouteConfig,
    RoutingConfig, SeriesConfig, TargetGroup, TierConfig, TierMode,
};
pub use engine::{ErrorOutcome, RoutingEngine, Selection, SelectionSource};
pub use health::HealthWeightCalculator;
pub use persistence::QuotaPersistence;
pub use pool::{CompiledRoutes, RoutePoolTier};
pub use priority::PrioritySelector;
pub use quota::{ErrorTransition, QuotaStateMachine};
pub use series::{ModelSeriesCooldownGuard, SeriesGrouping, SeriesTrip};
pub use sticky::{SessionFilter, StickyMode, StickyOutcome, StickySessionSelector, StickySessionState};
pub use strategy::{SmoothWeightedRoundRobin, starvation_bound};
