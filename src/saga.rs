//! Multi-step transactions with compensating rollback.
//!
//! What this module provides
//! - Ordered step execution where each step may carry an undo action; on
//!   failure, undo actions run in strictly reverse order for every step
//!   that had succeeded
//!
//! Exports
//! - Models
//!   - `SagaStep` (execute, optional compensate, stop-on-failure flag)
//!   - `ExecutedStep` (name, result, timestamp, pending compensation)
//!   - `SagaState` for the run's lifecycle
//!   - `SagaReport` (run id, reduced value, executed steps)
//! - Runners
//!   - `Saga` built from an ordered step list and a result reducer
//!
//! Implementation strategy
//! - Steps receive a `SagaContext` of prior results by name and produce
//!   `serde_json::Value`, so heterogeneous steps compose in one run
//! - Compensation is best-effort and single-attempt: failures are caught,
//!   collected, alerted, and never stop compensation of earlier steps
//! - The original transaction failure is always the one re-raised
//!
//! Testing strategy
//! - Record step/compensation invocation order with shared logs; assert
//!   reverse-order completeness and that successful runs never compensate

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{CompensationFailure, ResilienceError, Result};
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::failure::Failure;

pub type StepFn =
    Arc<dyn Fn(SagaContext) -> BoxFuture<'static, std::result::Result<Value, Failure>> + Send + Sync>;
pub type CompensateFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<(), Failure>> + Send + Sync>;
pub type ReducerFn = Arc<dyn Fn(&[ExecutedStep]) -> Value + Send + Sync>;

/// Results of the steps that have succeeded so far, by step name.
#[derive(Clone, Default)]
pub struct SagaContext {
    results: HashMap<String, Value>,
}

impl SagaContext {
    pub fn get(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    fn insert(&mut self, step: String, value: Value) {
        self.results.insert(step, value);
    }
}

impl fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext")
            .field("steps", &self.results.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One forward step and, optionally, its undo.
pub struct SagaStep {
    name: String,
    execute: StepFn,
    compensate: Option<CompensateFn>,
    stop_on_failure: bool,
}

impl SagaStep {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Failure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx| Box::pin(execute(ctx))),
            compensate: None,
            stop_on_failure: true,
        }
    }

    /// Undo action invoked with the step's own result during rollback.
    pub fn compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |value| Box::pin(compensate(value))));
        self
    }

    /// Mark this step best-effort: its failure neither aborts the saga nor
    /// triggers compensation.
    pub fn best_effort(mut self) -> Self {
        self.stop_on_failure = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("compensates", &self.compensate.is_some())
            .field("stop_on_failure", &self.stop_on_failure)
            .finish()
    }
}

/// A successfully executed step awaiting possible compensation. Owned by
/// one run; the list grows during forward execution and is consumed in
/// reverse during rollback.
#[derive(Clone)]
pub struct ExecutedStep {
    pub step_name: String,
    pub result: Value,
    pub executed_at: DateTime<Utc>,
    compensate: Option<CompensateFn>,
}

impl fmt::Debug for ExecutedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutedStep")
            .field("step_name", &self.step_name)
            .field("executed_at", &self.executed_at)
            .finish()
    }
}

/// Lifecycle of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Pending,
    Executing,
    Compensating,
    Completed,
    Failed,
}

/// Outcome of a fully successful run.
#[derive(Debug)]
pub struct SagaReport {
    pub run_id: Uuid,
    pub value: Value,
    pub steps: Vec<ExecutedStep>,
}

/// Executes steps strictly in order, rolling back on failure.
pub struct Saga {
    name: String,
    steps: Vec<SagaStep>,
    reducer: ReducerFn,
    sink: Arc<dyn EventSink>,
}

impl Saga {
    pub fn builder(name: impl Into<String>) -> SagaBuilder {
        SagaBuilder {
            name: name.into(),
            steps: Vec::new(),
            reducer: None,
            sink: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self) -> Result<SagaReport> {
        let run_id = Uuid::new_v4();
        let mut context = SagaContext::default();
        let mut executed: Vec<ExecutedStep> = Vec::new();

        for step in &self.steps {
            debug!(saga = %self.name, %run_id, step = %step.name, state = ?SagaState::Executing, "executing step");

            match (step.execute)(context.clone()).await {
                Ok(value) => {
                    context.insert(step.name.clone(), value.clone());
                    executed.push(ExecutedStep {
                        step_name: step.name.clone(),
                        result: value,
                        executed_at: Utc::now(),
                        compensate: step.compensate.clone(),
                    });
                }
                Err(failure) if step.stop_on_failure => {
                    warn!(saga = %self.name, %run_id, step = %step.name, %failure, state = ?SagaState::Compensating, "step failed, compensating");
                    let compensation_failures = self.compensate_executed(run_id, &mut executed).await;
                    debug!(saga = %self.name, %run_id, state = ?SagaState::Failed, "saga finished");
                    return Err(ResilienceError::SagaFailed {
                        name: self.name.clone(),
                        run_id,
                        step: step.name.clone(),
                        failure,
                        compensation_failures,
                    });
                }
                Err(failure) => {
                    // Best-effort step: no compensation (it never succeeded),
                    // forward execution continues.
                    warn!(saga = %self.name, %run_id, step = %step.name, %failure, "best-effort step failed, continuing");
                }
            }
        }

        debug!(saga = %self.name, %run_id, state = ?SagaState::Completed, steps = executed.len(), "saga finished");
        Ok(SagaReport {
            run_id,
            value: (self.reducer)(&executed),
            steps: executed,
        })
    }

    /// Undo every executed step in reverse order, best-effort.
    async fn compensate_executed(
        &self,
        run_id: Uuid,
        executed: &mut Vec<ExecutedStep>,
    ) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();

        while let Some(step) = executed.pop() {
            let Some(compensate) = step.compensate.clone() else {
                continue;
            };
            match compensate(step.result.clone()).await {
                Ok(()) => {
                    debug!(saga = %self.name, %run_id, step = %step.step_name, "compensated");
                }
                Err(failure) => {
                    error!(saga = %self.name, %run_id, step = %step.step_name, %failure, "compensation failed");
                    self.sink.record(ResilienceEvent::SagaCompensationFailed {
                        saga: self.name.clone(),
                        step: step.step_name.clone(),
                        message: failure.to_string(),
                    });
                    failures.push(CompensationFailure {
                        step: step.step_name.clone(),
                        failure,
                    });
                }
            }
        }

        failures
    }
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish()
    }
}

pub struct SagaBuilder {
    name: String,
    steps: Vec<SagaStep>,
    reducer: Option<ReducerFn>,
    sink: Option<Arc<dyn EventSink>>,
}

impl SagaBuilder {
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Aggregate step results into the final value. Defaults to the last
    /// step's result.
    pub fn reduce<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&[ExecutedStep]) -> Value + Send + Sync + 'static,
    {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Saga {
        Saga {
            name: self.name,
            steps: self.steps,
            reducer: self.reducer.unwrap_or_else(|| {
                Arc::new(|steps: &[ExecutedStep]| {
                    steps.last().map(|s| s.result.clone()).unwrap_or(Value::Null)
                })
            }),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}
