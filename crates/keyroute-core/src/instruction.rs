//! Routing instructions and per-request selection context
//!
//! Instructions arrive already parsed; turning user-facing directive text
//! into these values happens upstream of the engine.

use crate::key::ProviderKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Matches keys by provider, optionally narrowed by model and alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSelector {
    pub provider_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub key_alias: Option<String>,
}

impl TargetSelector {
    /// Every key of a provider
    pub fn provider(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: None,
            key_alias: None,
        }
    }

    /// Every key of a provider serving one model
    pub fn model(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: Some(model_id.into()),
            key_alias: None,
        }
    }

    /// Exactly one key
    pub fn key(key: &ProviderKey) -> Self {
        Self {
            provider_id: key.provider_id.clone(),
            model_id: Some(key.model_id.clone()),
            key_alias: Some(key.key_alias.clone()),
        }
    }

    /// Check if the selector covers the given key
    pub fn matches(&self, key: &ProviderKey) -> bool {
        self.provider_id == key.provider_id
            && self.model_id.as_ref().is_none_or(|m| *m == key.model_id)
            && self.key_alias.as_ref().is_none_or(|a| *a == key.key_alias)
    }
}

/// Already-parsed routing directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum RoutingInstruction {
    /// Route this request to the given provider/model (and alias, if set)
    Force {
        provider_id: String,
        model_id: String,
        #[serde(default)]
        key_alias: Option<String>,
    },
    /// Bind the session to a model (any alias) or to one key (alias set)
    Sticky {
        provider_id: String,
        model_id: String,
        #[serde(default)]
        key_alias: Option<String>,
    },
    /// Restrict selection to these providers
    Allow { providers: Vec<String> },
    /// Exclude matching keys
    Disable { target: TargetSelector },
    /// Lift a previous `Disable`
    Enable { target: TargetSelector },
    /// Drop all session routing state
    Clear,
}

/// Request capability hint; any hint bypasses sticky routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestHint {
    Vision,
    WebSearch,
    LongContext,
}

/// Per-request selection input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionContext {
    /// Instructions parsed from this request
    #[serde(default)]
    pub instructions: Vec<RoutingInstruction>,
    /// Keys that already failed for this request
    #[serde(default)]
    pub excluded_provider_keys: HashSet<ProviderKey>,
    /// True when the caller is re-selecting after a dispatch failure
    #[serde(default)]
    pub is_retry_attempt: bool,
    /// Session/conversation key for sticky routing
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub hint: Option<RequestHint>,
}

impl SelectionContext {
    /// Create an empty selection context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session key
    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Add a routing instruction
    pub fn with_instruction(mut self, instruction: RoutingInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Set the request hint
    pub fn with_hint(mut self, hint: RequestHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Mark this selection as a retry that must avoid `key`
    pub fn retry_excluding(mut self, key: ProviderKey) -> Self {
        self.is_retry_attempt = true;
        self.excluded_provider_keys.insert(key);
        self
    }

    /// True if this is a retry with at least one excluded key
    pub fn wants_recovery(&self) -> bool {
        self.is_retry_attempt && !self.excluded_provider_keys.is_empty()
    }
}
