//! KeyRoute Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout KeyRoute:
//! - Provider key identity and error classification
//! - Provider events and already-parsed routing instructions
//! - Quota state entries and the persisted snapshot format
//! - The quota store and clock abstractions
//! - Core error types

pub mod clock;
pub mod error;
pub mod events;
pub mod instruction;
pub mod key;
pub mod quota;
pub mod quota_store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, Result};
pub use events::{ErrorClass, ExternalQuotaSnapshot, ProviderErrorEvent, ProviderSuccessEvent};
pub use instruction::{RequestHint, RoutingInstruction, SelectionContext, TargetSelector};
pub use key::ProviderKey;
pub use quota::{KeyLimits, QuotaReason, QuotaSnapshot, QuotaStateEntry};
pub use quota_store::QuotaStore;
