//! # steadfast
//!
//! A resilience execution framework for unreliable downstream operations:
//! network calls, downloads, multi-step distributed transactions. The
//! runners are independent and composable: a saga step may itself be
//! retried, and a retried operation may run inside a bulkhead.
//!
//! ## Components
//!
//! - **RetryExecutor**: classified retry with exponential backoff + jitter
//! - **StrategyChain**: ordered alternative means of achieving one goal
//! - **DegradationLadder**: gated reduced-fidelity fallbacks
//! - **Bulkhead**: per-resource-class concurrency isolation
//! - **Saga**: multi-step transactions with compensating rollback
//! - **DeadlineRunner**: an operation list under one time budget
//! - **layers**: Tower middleware adapters for the above
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use steadfast::{ExponentialBackoff, Failure, FailureCategory, RetryExecutor};
//!
//! # async fn example() -> Result<(), steadfast::ResilienceError> {
//! let executor = RetryExecutor::builder()
//!     .policy(
//!         FailureCategory::TransientNetwork,
//!         ExponentialBackoff::new(3, Duration::from_millis(200))
//!             .with_jitter(Duration::from_millis(100)),
//!     )
//!     .build();
//!
//! let report = executor
//!     .execute(|| async {
//!         fetch_report()
//!             .await
//!             .map_err(|e| Failure::new(e.to_string()))
//!     })
//!     .await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! # async fn fetch_report() -> Result<String, std::io::Error> { Ok(String::new()) }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

pub mod bulkhead;
pub mod config;
pub mod deadline;
pub mod degradation;
pub mod error;
pub mod events;
pub mod failure;
pub mod layers;
pub mod retry;
pub mod saga;
pub mod sleeper;
pub mod strategy;

// Public re-exports for convenience
pub use bulkhead::Bulkhead;
pub use config::{BulkheadConfig, ConfigBuilder, ResilienceConfig, RetryPolicyConfig, RetryTableConfig};
pub use deadline::{DeadlineOperation, DeadlineReport, DeadlineRunner, OperationResult};
pub use degradation::{
    DegradationLadder, DegradationLevel, DegradationOutcome, FeatureFlags, HealthMonitor,
    HealthStatus,
};
pub use error::{CompensationFailure, ResilienceError, Result, StrategyAttempt};
pub use events::{BulkheadRejection, EventSink, MemorySink, ResilienceEvent, TracingSink};
pub use failure::{
    default_classifier, Failure, FailureCategory, FailureClassifier, PredicateClassifier,
    RecoveryIntent,
};
pub use retry::{
    ExponentialBackoff, PolicyRegistry, RetryDecision, RetryExecutor, RetryPolicy,
};
pub use saga::{ExecutedStep, Saga, SagaContext, SagaReport, SagaState, SagaStep};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use strategy::{strategy_fn, FnStrategy, Strategy, StrategyChain};

// =============================
// Operation plumbing
// =============================

/// The future produced by a type-erased operation.
pub type OpFuture<T> = BoxFuture<'static, std::result::Result<T, Failure>>;

/// The operation contract: any async callable resolving with a result or
/// raising a [`Failure`]. The framework assumes no idempotence; retried
/// operations should be idempotent or callers accept at-least-once effects.
pub type OpFn<T> = Arc<dyn Fn() -> OpFuture<T> + Send + Sync>;

/// Type-erase an async closure into an [`OpFn`].
pub fn op_fn<T, F, Fut>(f: F) -> OpFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn op_fn_erases_a_closure() {
        let op = op_fn(|| async { Ok::<_, Failure>(3) });
        assert_eq!(op().await.unwrap(), 3);
    }
}
