//! Retry configuration surface, global and per service.
//!
//! ```rust
//! use balanced_retry::RetryProperties;
//!
//! let props = RetryProperties::from_json_str(r#"{
//!     "defaults": { "max_attempts_same_instance": 2, "max_attempts_next_instance": 1 },
//!     "services": {
//!         "payments": { "enabled": false },
//!         "catalog": { "retryable_status_codes": [502, 503], "retry_on_all_operations": true }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(props.config_for("users").max_attempts_same_instance, 2);
//! assert!(!props.config_for("payments").enabled);
//! assert!(props.config_for("catalog").retryable_status_codes.contains(&503));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::{ConfigError, ConnectivityErrorKind};

const DEFAULT_MIN_BACKOFF_MS: u64 = 5;
const DEFAULT_JITTER: f64 = 0.5;

/// Delay settings applied between retries. Disabled by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub min_backoff_ms: u64,
    /// `None` leaves only the global one-day ceiling.
    pub max_backoff_ms: Option<u64>,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: None,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffConfig {
    /// The configured backoff, or `None` when disabled.
    pub fn to_backoff(&self) -> Result<Option<Backoff>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        Backoff::new(
            Duration::from_millis(self.min_backoff_ms),
            self.max_backoff_ms.map(Duration::from_millis),
            self.jitter,
        )
        .map(Some)
    }
}

/// Retry settings for one service (or the global default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// When false the service never retries.
    pub enabled: bool,
    /// When false only read-only methods are retried.
    pub retry_on_all_operations: bool,
    /// Attempts allowed on one instance before failing over. At least 1.
    pub max_attempts_same_instance: usize,
    /// Additional instances to fail over to after the first.
    pub max_attempts_next_instance: usize,
    /// Response statuses treated as retryable outcomes.
    pub retryable_status_codes: BTreeSet<u16>,
    /// Transport failure kinds treated as retryable.
    pub retryable_failures: BTreeSet<ConnectivityErrorKind>,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_on_all_operations: false,
            max_attempts_same_instance: 1,
            max_attempts_next_instance: 1,
            retryable_status_codes: BTreeSet::new(),
            retryable_failures: [
                ConnectivityErrorKind::Connect,
                ConnectivityErrorKind::Timeout,
                ConnectivityErrorKind::Reset,
            ]
            .into_iter()
            .collect(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicyConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Set both budgets. `same_instance` must stay at least one.
    pub fn with_attempts(mut self, same_instance: usize, next_instance: usize) -> Self {
        self.max_attempts_same_instance = same_instance;
        self.max_attempts_next_instance = next_instance;
        self
    }

    /// Allow retrying methods that are not safe to repeat.
    pub fn with_retry_on_all_operations(mut self, all: bool) -> Self {
        self.retry_on_all_operations = all;
        self
    }

    /// Replace the set of statuses treated as retryable.
    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_retryable_failures(
        mut self,
        kinds: impl IntoIterator<Item = ConnectivityErrorKind>,
    ) -> Self {
        self.retryable_failures = kinds.into_iter().collect();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upper bound on attempts for one call under this config.
    pub fn max_total_attempts(&self) -> usize {
        self.max_attempts_same_instance
            .saturating_mul(self.max_attempts_next_instance.saturating_add(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts_same_instance == 0 {
            return Err(ConfigError::InvalidSameInstanceAttempts(0));
        }
        if let Some(bad) = self.retryable_status_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(ConfigError::InvalidStatusCode(*bad));
        }
        self.backoff.to_backoff()?;
        Ok(())
    }
}

/// Top-level retry properties: a global switch, defaults, and per-service overrides.
///
/// A service entry replaces the defaults wholesale; unspecified fields take the
/// [`RetryPolicyConfig`] defaults, not the values under `defaults`. Without a `defaults`
/// entry, services that are not listed never retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProperties {
    /// When false, callers are composed with the plain interceptor and nothing retries.
    pub enabled: bool,
    pub defaults: RetryPolicyConfig,
    pub services: BTreeMap<String, RetryPolicyConfig>,
}

impl Default for RetryProperties {
    fn default() -> Self {
        Self { enabled: true, defaults: RetryPolicyConfig::disabled(), services: BTreeMap::new() }
    }
}

impl RetryProperties {
    /// Parse and validate properties from JSON.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let props: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        props.validate()?;
        Ok(props)
    }

    /// Override the config for one service.
    pub fn with_service(mut self, service: impl Into<String>, config: RetryPolicyConfig) -> Self {
        self.services.insert(service.into(), config);
        self
    }

    /// Effective config for `service`.
    pub fn config_for(&self, service: &str) -> &RetryPolicyConfig {
        self.services.get(service).unwrap_or(&self.defaults)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for config in self.services.values() {
            config.validate()?;
        }
        Ok(())
    }
}
