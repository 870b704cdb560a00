//! Provider key identity
//!
//! A `ProviderKey` names one routable combination of provider, credential
//! alias and model. It is the key of every per-credential map in KeyRoute.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator used in the textual form `provider/alias/model`
const SEPARATOR: char = '/';

/// Stable identity for one (provider, key alias, model) combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    /// Provider ID (e.g. "gemini", "openai")
    pub provider_id: String,
    /// Credential alias within the provider
    pub key_alias: String,
    /// Model served through this credential
    pub model_id: String,
}

impl ProviderKey {
    /// Create a new provider key
    pub fn new(
        provider_id: impl Into<String>,
        key_alias: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            key_alias: key_alias.into(),
            model_id: model_id.into(),
        }
    }

    /// True if both keys target the same provider and model
    pub fn same_model(&self, other: &ProviderKey) -> bool {
        self.provider_id == other.provider_id && self.model_id == other.model_id
    }

    /// True if the key belongs to the given provider and model
    pub fn serves(&self, provider_id: &str, model_id: &str) -> bool {
        self.provider_id == provider_id && self.model_id == model_id
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.provider_id, self.key_alias, self.model_id
        )
    }
}

impl FromStr for ProviderKey {
    type Err = Error;

    /// Parse `provider/alias/model`. The model part may itself contain `/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, SEPARATOR);
        let provider = parts.next().unwrap_or_default();
        let alias = parts.next().unwrap_or_default();
        let model = parts.next().unwrap_or_default();

        if provider.is_empty() || alias.is_empty() || model.is_empty() {
            return Err(Error::InvalidProviderKey(s.to_string()));
        }

        Ok(Self::new(provider, alias, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let key = ProviderKey::new("gemini", "k1", "gemini-2.5-pro");
        assert_eq!(key.to_string(), "gemini/k1/gemini-2.5-pro");

        let parsed: ProviderKey = "gemini/k1/gemini-2.5-pro".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_model_with_slash() {
        let parsed: ProviderKey = "openrouter/main/anthropic/claude-3.5".parse().unwrap();
        assert_eq!(parsed.provider_id, "openrouter");
        assert_eq!(parsed.key_alias, "main");
        assert_eq!(parsed.model_id, "anthropic/claude-3.5");
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!("gemini".parse::<ProviderKey>().is_err());
        assert!("gemini/k1".parse::<ProviderKey>().is_err());
        assert!("gemini//m".parse::<ProviderKey>().is_err());
    }

    #[test]
    fn test_same_model() {
        let a = ProviderKey::new("p", "a1", "m");
        let b = ProviderKey::new("p", "a2", "m");
        let c = ProviderKey::new("p", "a1", "other");
        assert!(a.same_model(&b));
        assert!(!a.same_model(&c));
        assert!(a.serves("p", "m"));
    }
}
