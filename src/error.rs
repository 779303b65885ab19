//! Error types for the resilience framework.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::failure::{Failure, FailureCategory};

/// Result type alias for the framework.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// One failed strategy inside a chain run.
#[derive(Debug, Clone)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub failure: Failure,
}

impl std::fmt::Display for StrategyAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.failure)
    }
}

/// One failed compensation inside a saga rollback.
#[derive(Debug, Clone)]
pub struct CompensationFailure {
    pub step: String,
    pub failure: Failure,
}

/// Typed failures surfaced by the runners.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The last failure of an operation, re-raised after recovery gave up.
    #[error(transparent)]
    Failure(#[from] Failure),

    /// A chain was configured with no strategies.
    #[error("strategy chain has no strategies configured")]
    NoStrategies,

    /// Every strategy in a chain was tried and failed.
    #[error("all {} strategies failed: {}", .attempts.len(), describe_attempts(.attempts))]
    StrategiesExhausted { attempts: Vec<StrategyAttempt> },

    /// A strategy raised a failure the chain must not recover from.
    #[error("strategy '{strategy}' raised a fatal failure: {failure}")]
    FatalStrategyFailure {
        strategy: String,
        failure: Failure,
        /// Strategies attempted before the fatal one, in order.
        attempts: Vec<StrategyAttempt>,
    },

    /// The primary and every degradation level failed or was gated off.
    #[error("service unavailable; degradation levels attempted: {}", .attempted.join(", "))]
    ServiceUnavailable { attempted: Vec<String> },

    /// A saturated bulkhead with a full queue turned the caller away.
    #[error("bulkhead '{resource_class}' rejected: queue full ({max_queue_size})")]
    BulkheadRejected {
        resource_class: String,
        max_queue_size: usize,
    },

    /// A queued caller's wait for a bulkhead slot expired.
    #[error("bulkhead '{resource_class}' queue timeout after {waited:?}")]
    BulkheadQueueTimeout {
        resource_class: String,
        waited: Duration,
    },

    /// An operation lost its timeout race.
    #[error("operation '{name}' timed out after {limit:?}")]
    Timeout { name: String, limit: Duration },

    /// A saga step failed; compensation has already run best-effort.
    #[error("saga '{name}' failed at step '{step}': {failure}")]
    SagaFailed {
        name: String,
        run_id: Uuid,
        step: String,
        failure: Failure,
        /// Compensations that themselves failed, in rollback order.
        compensation_failures: Vec<CompensationFailure>,
    },
}

fn describe_attempts(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ResilienceError {
    /// The original failure carried by this error, if there is a single one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ResilienceError::Failure(f) => Some(f),
            ResilienceError::FatalStrategyFailure { failure, .. } => Some(failure),
            ResilienceError::SagaFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }
}

/// Flattens a typed runner error back into the `Failure` currency, so a
/// runner's output can feed another runner (a saga step that is itself a
/// bulkhead-wrapped retry, for example).
impl From<ResilienceError> for Failure {
    fn from(error: ResilienceError) -> Self {
        match error {
            ResilienceError::Failure(f) => f,
            ResilienceError::NoStrategies => {
                Failure::with_category(FailureCategory::Validation, error.to_string())
                    .set_critical()
            }
            ResilienceError::Timeout { .. } => {
                Failure::with_category(FailureCategory::TransientNetwork, error.to_string())
            }
            ResilienceError::FatalStrategyFailure { failure, .. } => failure,
            ResilienceError::SagaFailed { ref failure, .. } => failure
                .clone()
                .ensure_category(FailureCategory::SystemFailure),
            other => Failure::with_category(FailureCategory::SystemFailure, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_display_names_every_strategy() {
        let err = ResilienceError::StrategiesExhausted {
            attempts: vec![
                StrategyAttempt {
                    strategy: "primary-cdn".into(),
                    failure: Failure::new("503 from origin"),
                },
                StrategyAttempt {
                    strategy: "mirror".into(),
                    failure: Failure::new("connection refused"),
                },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("primary-cdn"));
        assert!(rendered.contains("mirror"));
        assert!(rendered.contains("2 strategies"));
    }

    #[test]
    fn service_unavailable_names_levels() {
        let err = ResilienceError::ServiceUnavailable {
            attempted: vec!["cached".into(), "placeholder".into()],
        };
        assert_eq!(
            err.to_string(),
            "service unavailable; degradation levels attempted: cached, placeholder"
        );
    }

    #[test]
    fn flattening_preserves_the_inner_failure() {
        let inner = Failure::with_category(FailureCategory::RateLimit, "slow down");
        let err = ResilienceError::Failure(inner);
        let flat: Failure = err.into();
        assert_eq!(flat.category(), Some(FailureCategory::RateLimit));
    }

    #[test]
    fn flattened_rejection_is_a_system_failure() {
        let err = ResilienceError::BulkheadRejected {
            resource_class: "image-api".into(),
            max_queue_size: 4,
        };
        let flat: Failure = err.into();
        assert_eq!(flat.category(), Some(FailureCategory::SystemFailure));
        assert!(flat.message().contains("image-api"));
    }

    #[test]
    fn timeout_flattens_to_transient() {
        let err = ResilienceError::Timeout {
            name: "fetch".into(),
            limit: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        let flat: Failure = err.into();
        assert_eq!(flat.category(), Some(FailureCategory::TransientNetwork));
    }
}
