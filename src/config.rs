//! Configuration surface for the resilience runners.
//!
//! Every component is constructed from plain, serializable configuration:
//! retry policy tables keyed by failure category, bulkhead limits, and the
//! deadline budget. Configs load from TOML files and accept a small set of
//! environment overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::FailureCategory;

/// Backoff parameters for one failure category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Retry attempts beyond the initial call. Must be finite.
    pub max_attempts: usize,

    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,

    /// Upper bound of the random jitter added to each delay.
    pub jitter_max: Duration,

    /// Cap applied after doubling, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            jitter_max: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(10)),
        }
    }
}

/// Per-category retry policy table. Categories absent from the table are
/// not retryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTableConfig {
    pub policies: HashMap<FailureCategory, RetryPolicyConfig>,
}

impl Default for RetryTableConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(FailureCategory::TransientNetwork, RetryPolicyConfig::default());
        policies.insert(
            FailureCategory::RateLimit,
            RetryPolicyConfig {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                jitter_max: Duration::from_millis(500),
                max_delay: Some(Duration::from_secs(30)),
            },
        );
        policies.insert(
            FailureCategory::SystemFailure,
            RetryPolicyConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(500),
                jitter_max: Duration::from_millis(250),
                max_delay: Some(Duration::from_secs(10)),
            },
        );
        Self { policies }
    }
}

/// Limits for one bulkhead resource class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Operations allowed to run at once.
    pub max_concurrent: usize,

    /// Callers allowed to wait for a slot; further callers are rejected.
    pub max_queue_size: usize,

    /// How long a queued caller waits before giving up.
    pub queue_timeout: Duration,

    /// Timeout applied to each operation once it holds a slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 32,
            queue_timeout: Duration::from_secs(5),
            operation_timeout: None,
        }
    }
}

/// Top-level configuration for an application embedding the framework.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Overall budget for deadline-run operation lists, if one applies
    /// globally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_deadline: Option<Duration>,

    #[serde(default)]
    pub retry: RetryTableConfig,

    #[serde(default)]
    pub bulkhead: BulkheadConfig,
}

/// Builder for [`ResilienceConfig`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ResilienceConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_policy(mut self, category: FailureCategory, policy: RetryPolicyConfig) -> Self {
        self.config.retry.policies.insert(category, policy);
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.config.bulkhead.max_concurrent = limit;
        self
    }

    pub fn max_queue_size(mut self, limit: usize) -> Self {
        self.config.bulkhead.max_queue_size = limit;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.bulkhead.queue_timeout = timeout;
        self
    }

    pub fn total_deadline(mut self, deadline: Duration) -> Self {
        self.config.total_deadline = Some(deadline);
        self
    }

    pub fn build(self) -> ResilienceConfig {
        self.config
    }
}

/// Load configuration from a TOML file.
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> std::result::Result<ResilienceConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ResilienceConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Apply environment overrides to a configuration.
///
/// Recognized: `STEADFAST_MAX_CONCURRENT`, `STEADFAST_QUEUE_TIMEOUT_MS`,
/// `STEADFAST_RETRY_MAX_ATTEMPTS` (applies to every configured category).
pub fn apply_env(mut config: ResilienceConfig) -> ResilienceConfig {
    if let Ok(value) = std::env::var("STEADFAST_MAX_CONCURRENT") {
        if let Ok(limit) = value.parse::<usize>() {
            config.bulkhead.max_concurrent = limit;
        }
    }

    if let Ok(value) = std::env::var("STEADFAST_QUEUE_TIMEOUT_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.bulkhead.queue_timeout = Duration::from_millis(ms);
        }
    }

    if let Ok(value) = std::env::var("STEADFAST_RETRY_MAX_ATTEMPTS") {
        if let Ok(max) = value.parse::<usize>() {
            for policy in config.retry.policies.values_mut() {
                policy.max_attempts = max;
            }
        }
    }

    config
}
