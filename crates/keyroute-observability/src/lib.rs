//! KeyRoute Observability
//!
//! This crate provides observability features:
//! - Routing metrics (Prometheus)
//! - Structured logging setup

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, init_logging};
pub use metrics::RoutingMetrics;
