//! Provider events consumed by the routing engine
//!
//! Request dispatch reports every upstream outcome back to the engine as one
//! of these events. Timestamps are Unix milliseconds taken from the engine's
//! clock by the caller.

use crate::key::ProviderKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized error class used to scope cooldown escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Rate limited (HTTP 429)
    #[serde(rename = "E429")]
    RateLimited,
    /// Upstream server error (HTTP 5xx and unrecognized 4xx)
    #[serde(rename = "E5XX")]
    ServerError,
    /// Transport failure (timeouts, resets, no response)
    #[serde(rename = "ENET")]
    Network,
    /// Auth, account or model configuration failure
    #[serde(rename = "EFATAL")]
    Fatal,
}

/// Error codes that mark a credential or model as unusable until fixed
const FATAL_CODES: &[&str] = &[
    "invalid_api_key",
    "authentication_error",
    "permission_denied",
    "model_not_found",
    "account_disabled",
];

/// Error codes reported for transport-level failures
const NETWORK_CODES: &[&str] = &[
    "timeout",
    "connection_reset",
    "connection_refused",
    "network",
];

impl ErrorClass {
    /// Classify an upstream failure from its HTTP status and error code
    ///
    /// A recognized error code wins over the status. Without either, the
    /// failure is treated as a transport error.
    pub fn classify(http_status: Option<u16>, error_code: Option<&str>) -> Self {
        if let Some(code) = error_code {
            let code = code.to_ascii_lowercase();
            if FATAL_CODES.contains(&code.as_str()) {
                return ErrorClass::Fatal;
            }
            if NETWORK_CODES.contains(&code.as_str()) {
                return ErrorClass::Network;
            }
        }

        match http_status {
            Some(429) => ErrorClass::RateLimited,
            Some(401..=404) => ErrorClass::Fatal,
            Some(408) | None => ErrorClass::Network,
            Some(_) => ErrorClass::ServerError,
        }
    }

    /// Retryable classes escalate and self-heal; fatal ones do not
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }

    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "E429",
            ErrorClass::ServerError => "E5XX",
            ErrorClass::Network => "ENET",
            ErrorClass::Fatal => "EFATAL",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream request through `provider_key` failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderErrorEvent {
    pub provider_key: ProviderKey,
    /// Provider-specific error code (e.g. "MODEL_CAPACITY_EXHAUSTED")
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub http_status: Option<u16>,
    /// Retry-After hint sent by the provider
    #[serde(default)]
    pub retry_after_ms: Option<i64>,
    pub ts_ms: i64,
}

impl ProviderErrorEvent {
    /// Create an error event with no status or code (a transport failure)
    pub fn new(provider_key: ProviderKey, ts_ms: i64) -> Self {
        Self {
            provider_key,
            error_code: None,
            http_status: None,
            retry_after_ms: None,
            ts_ms,
        }
    }

    /// Set the HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Set the provider error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Set the Retry-After hint
    pub fn with_retry_after_ms(mut self, retry_after_ms: i64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Error class of this event
    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(self.http_status, self.error_code.as_deref())
    }
}

/// An upstream request through `provider_key` succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSuccessEvent {
    pub provider_key: ProviderKey,
    pub ts_ms: i64,
}

impl ProviderSuccessEvent {
    pub fn new(provider_key: ProviderKey, ts_ms: i64) -> Self {
        Self {
            provider_key,
            ts_ms,
        }
    }
}

/// Quota information reported by a provider's own quota API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalQuotaSnapshot {
    pub provider_key: ProviderKey,
    /// Remaining share of the quota (0.0 to 1.0)
    pub remaining_fraction: f64,
    /// When the provider resets the quota (Unix ms)
    #[serde(default)]
    pub reset_at_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(ErrorClass::classify(Some(429), None), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::classify(Some(500), None), ErrorClass::ServerError);
        assert_eq!(ErrorClass::classify(Some(503), None), ErrorClass::ServerError);
        assert_eq!(ErrorClass::classify(Some(401), None), ErrorClass::Fatal);
        assert_eq!(ErrorClass::classify(Some(403), None), ErrorClass::Fatal);
        assert_eq!(ErrorClass::classify(Some(404), None), ErrorClass::Fatal);
        assert_eq!(ErrorClass::classify(Some(408), None), ErrorClass::Network);
        assert_eq!(ErrorClass::classify(None, None), ErrorClass::Network);
        assert_eq!(ErrorClass::classify(Some(400), None), ErrorClass::ServerError);
    }

    #[test]
    fn test_classify_code_wins() {
        assert_eq!(
            ErrorClass::classify(Some(400), Some("INVALID_API_KEY")),
            ErrorClass::Fatal
        );
        assert_eq!(
            ErrorClass::classify(Some(502), Some("timeout")),
            ErrorClass::Network
        );
        // Unknown codes fall back to the status
        assert_eq!(
            ErrorClass::classify(Some(429), Some("MODEL_CAPACITY_EXHAUSTED")),
            ErrorClass::RateLimited
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::Network.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }

    #[test]
    fn test_error_class_serde_labels() {
        let json = serde_json::to_string(&ErrorClass::ServerError).unwrap();
        assert_eq!(json, "\"E5XX\"");
        let class: ErrorClass = serde_json::from_str("\"EFATAL\"").unwrap();
        assert_eq!(class, ErrorClass::Fatal);
    }

    #[test]
    fn test_error_event_builder() {
        let key = ProviderKey::new("p", "a", "m");
        let event = ProviderErrorEvent::new(key.clone(), 1_000)
            .with_status(429)
            .with_code("rate_limit")
            .with_retry_after_ms(30_000);

        assert_eq!(event.class(), ErrorClass::RateLimited);
        assert_eq!(event.retry_after_ms, Some(30_000));
        assert_eq!(event.provider_key, key);
    }
}
