//! Deadline-budgeted multi-step execution.
//!
//! What this module provides
//! - Sequential execution of an operation list under one overall time
//!   budget, allocating a sub-budget to each operation with per-operation
//!   fallback when its sub-budget is exceeded
//!
//! Exports
//! - Models
//!   - `DeadlineOperation` (execute, max time, fallback, critical flag)
//!   - `OperationResult` (one per executed operation, never mutated)
//!   - `DeadlineReport` (results, total duration, aggregate verdict)
//! - Runners
//!   - `DeadlineRunner`
//!
//! Implementation strategy
//! - Budget checks happen between operations: remaining time is recomputed
//!   after each one, and exhaustion omits the unstarted rest from results
//! - An operation's deadline is `min(its max time, remaining budget)`; a
//!   timed-out operation falls back when a fallback is configured, and the
//!   original timeout is recorded if the fallback also fails
//! - A non-timeout failure on a critical operation aborts the run
//!
//! Testing strategy
//! - Operations with controlled sleeps; assert sub-budget allocation,
//!   fallback accounting, omission on exhaustion, and the report counters

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::failure::Failure;
use crate::{op_fn, OpFn};

/// One operation in a deadline-budgeted run. Read-only configuration.
pub struct DeadlineOperation {
    name: String,
    execute: OpFn<Value>,
    max_time: Option<Duration>,
    fallback: Option<OpFn<Value>>,
    fallback_max_time: Option<Duration>,
    critical: bool,
}

impl DeadlineOperation {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: op_fn(execute),
            max_time: None,
            fallback: None,
            fallback_max_time: None,
            critical: false,
        }
    }

    /// Cap this operation's share of the budget.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }

    /// Cheaper alternative raced against the remaining budget when the
    /// operation times out.
    pub fn fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        self.fallback = Some(op_fn(fallback));
        self
    }

    pub fn fallback_max_time(mut self, limit: Duration) -> Self {
        self.fallback_max_time = Some(limit);
        self
    }

    /// A non-timeout failure here aborts the remaining operations.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DeadlineOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineOperation")
            .field("name", &self.name)
            .field("max_time", &self.max_time)
            .field("has_fallback", &self.fallback.is_some())
            .field("critical", &self.critical)
            .finish()
    }
}

/// Outcome of one executed operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub name: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<Failure>,
    pub duration: Duration,
    pub used_fallback: bool,
}

/// Aggregate outcome of a run. Operations never started because the budget
/// ran out are absent from `results`.
#[derive(Debug)]
pub struct DeadlineReport {
    pub results: Vec<OperationResult>,
    pub total_duration: Duration,
    pub deadline_exceeded: bool,
    pub successful_count: usize,
}

/// Runs an ordered operation list under a single time budget.
pub struct DeadlineRunner {
    operations: Vec<DeadlineOperation>,
    total_deadline: Duration,
    sink: Arc<dyn EventSink>,
}

impl DeadlineRunner {
    pub fn builder(total_deadline: Duration) -> DeadlineRunnerBuilder {
        DeadlineRunnerBuilder {
            operations: Vec::new(),
            total_deadline,
            sink: None,
        }
    }

    pub async fn run(&self) -> DeadlineReport {
        let started = Instant::now();
        let mut results: Vec<OperationResult> = Vec::new();
        let mut budget_exhausted = false;

        for operation in &self.operations {
            let remaining = self.total_deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                debug!(
                    omitted = self.operations.len() - results.len(),
                    "budget exhausted, omitting remaining operations"
                );
                budget_exhausted = true;
                break;
            }

            let limit = operation.max_time.map_or(remaining, |m| m.min(remaining));
            let op_started = Instant::now();

            let result = match timeout(limit, (operation.execute)()).await {
                Ok(Ok(output)) => OperationResult {
                    name: operation.name.clone(),
                    success: true,
                    output: Some(output),
                    error: None,
                    duration: op_started.elapsed(),
                    used_fallback: false,
                },
                Ok(Err(failure)) => {
                    warn!(operation = %operation.name, %failure, "operation failed");
                    let abort = operation.critical;
                    let result = OperationResult {
                        name: operation.name.clone(),
                        success: false,
                        output: None,
                        error: Some(failure),
                        duration: op_started.elapsed(),
                        used_fallback: false,
                    };
                    if abort {
                        warn!(operation = %operation.name, "critical operation failed, aborting run");
                        results.push(result);
                        break;
                    }
                    result
                }
                Err(_) => {
                    warn!(operation = %operation.name, ?limit, "operation timed out");
                    self.run_fallback(operation, op_started, limit, started).await
                }
            };

            results.push(result);
        }

        let total_duration = started.elapsed();
        let deadline_exceeded = budget_exhausted || total_duration > self.total_deadline;
        if deadline_exceeded {
            self.sink.record(ResilienceEvent::DeadlineExceeded {
                total_deadline: self.total_deadline,
                elapsed: total_duration,
            });
        }

        let successful_count = results.iter().filter(|r| r.success).count();
        DeadlineReport {
            results,
            total_duration,
            deadline_exceeded,
            successful_count,
        }
    }

    async fn run_fallback(
        &self,
        operation: &DeadlineOperation,
        op_started: Instant,
        limit: Duration,
        run_started: Instant,
    ) -> OperationResult {
        let timed_out = || OperationResult {
            name: operation.name.clone(),
            success: false,
            output: None,
            error: Some(Failure::timeout(
                format!("operation '{}'", operation.name),
                limit,
            )),
            duration: op_started.elapsed(),
            used_fallback: false,
        };

        let Some(fallback) = &operation.fallback else {
            return timed_out();
        };

        let remaining = self.total_deadline.saturating_sub(run_started.elapsed());
        if remaining.is_zero() {
            return timed_out();
        }
        let fallback_limit = operation
            .fallback_max_time
            .map_or(remaining, |m| m.min(remaining));

        match timeout(fallback_limit, fallback()).await {
            Ok(Ok(output)) => OperationResult {
                name: operation.name.clone(),
                success: true,
                output: Some(output),
                error: None,
                duration: op_started.elapsed(),
                used_fallback: true,
            },
            // The fallback failing records the original timeout.
            _ => timed_out(),
        }
    }
}

impl fmt::Debug for DeadlineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineRunner")
            .field("operations", &self.operations)
            .field("total_deadline", &self.total_deadline)
            .finish()
    }
}

pub struct DeadlineRunnerBuilder {
    operations: Vec<DeadlineOperation>,
    total_deadline: Duration,
    sink: Option<Arc<dyn EventSink>>,
}

impl DeadlineRunnerBuilder {
    pub fn operation(mut self, operation: DeadlineOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> DeadlineRunner {
        DeadlineRunner {
            operations: self.operations,
            total_deadline: self.total_deadline,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn quick(name: &str) -> DeadlineOperation {
        let payload = name.to_string();
        DeadlineOperation::new(name, move || {
            let payload = payload.clone();
            async move { Ok(json!(payload)) }
        })
    }

    fn slow(name: &str, delay: Duration) -> DeadlineOperation {
        DeadlineOperation::new(name, move || async move {
            sleep(delay).await;
            Ok(json!("slow"))
        })
    }

    #[tokio::test]
    async fn all_operations_within_budget() {
        let runner = DeadlineRunner::builder(Duration::from_secs(2))
            .operation(quick("a"))
            .operation(quick("b"))
            .operation(quick("c"))
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.successful_count, 3);
        assert!(!report.deadline_exceeded);
        assert!(report.results.iter().all(|r| !r.used_fallback));
    }

    #[tokio::test]
    async fn timeout_without_fallback_is_recorded_and_budget_carries_on() {
        let runner = DeadlineRunner::builder(Duration::from_millis(250))
            .operation(slow("laggard", Duration::from_millis(400)).max_time(Duration::from_millis(150)))
            .operation(quick("after"))
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 2);
        assert!(!report.results[0].success);
        assert!(report.results[0].error.is_some());
        assert!(report.results[1].success);
        assert_eq!(report.successful_count, 1);
    }

    #[tokio::test]
    async fn fallback_serves_after_timeout() {
        let runner = DeadlineRunner::builder(Duration::from_millis(500))
            .operation(
                slow("render", Duration::from_millis(300))
                    .max_time(Duration::from_millis(50))
                    .fallback(|| async { Ok(json!("low-res")) }),
            )
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert!(result.success);
        assert!(result.used_fallback);
        assert_eq!(result.output, Some(json!("low-res")));
        assert_eq!(report.successful_count, 1);
    }

    #[tokio::test]
    async fn failed_fallback_records_original_timeout() {
        let runner = DeadlineRunner::builder(Duration::from_millis(500))
            .operation(
                slow("render", Duration::from_millis(300))
                    .max_time(Duration::from_millis(50))
                    .fallback(|| async { Err::<Value, _>(Failure::new("fallback broke")) }),
            )
            .build();

        let report = runner.run().await;
        let result = &report.results[0];
        assert!(!result.success);
        assert!(!result.used_fallback);
        let error = result.error.as_ref().unwrap();
        assert!(error.message().contains("timed out"));
    }

    #[tokio::test]
    async fn exhausted_budget_omits_remaining_operations() {
        let sink = Arc::new(crate::events::MemorySink::new());
        let runner = DeadlineRunner::builder(Duration::from_millis(80))
            .operation(slow("eats-budget", Duration::from_millis(200)))
            .operation(quick("never-started"))
            .sink(sink.clone())
            .build();

        let report = runner.run().await;
        // The first operation consumed the whole budget (capped at the
        // remaining 80ms); the second is omitted, not failed.
        assert_eq!(report.results.len(), 1);
        assert!(report.deadline_exceeded);
        assert_eq!(report.successful_count, 0);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn critical_failure_aborts_the_run() {
        let runner = DeadlineRunner::builder(Duration::from_secs(1))
            .operation(quick("setup"))
            .operation(
                DeadlineOperation::new("must-work", || async {
                    Err::<Value, _>(Failure::new("hard failure"))
                })
                .critical(),
            )
            .operation(quick("skipped"))
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[1].name, "must-work");
        assert!(!report.results[1].success);
        assert_eq!(report.successful_count, 1);
    }

    #[tokio::test]
    async fn non_critical_failure_continues() {
        let runner = DeadlineRunner::builder(Duration::from_secs(1))
            .operation(DeadlineOperation::new("flaky", || async {
                Err::<Value, _>(Failure::new("soft failure"))
            }))
            .operation(quick("after"))
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 2);
        assert!(report.results[1].success);
    }

    #[tokio::test]
    async fn remaining_budget_caps_operation_deadline() {
        // The first operation leaves ~40ms; the second declares 500ms but is
        // capped by the remaining budget and times out.
        let runner = DeadlineRunner::builder(Duration::from_millis(100))
            .operation(slow("first", Duration::from_millis(60)))
            .operation(
                slow("second", Duration::from_millis(300)).max_time(Duration::from_millis(500)),
            )
            .build();

        let report = runner.run().await;
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert!(report.deadline_exceeded);
    }
}
