//! Structured events for metrics and alerting.
//!
//! What this module provides
//! - A typed event stream the runners emit at every recovery decision, with
//!   an injected sink so the integrating application chooses the transport
//!   (log line, metric counter, alert call)
//!
//! Exports
//! - Models
//!   - `ResilienceEvent` with one variant per observable decision
//! - Collaborators
//!   - `EventSink` (constructor-injected, `Arc<dyn EventSink>`)
//!   - `TracingSink` rendering events as structured tracing records (default)
//!   - `MemorySink` capturing events for assertions
//!
//! Testing strategy
//! - Inject a `MemorySink` and assert the exact sequence of emitted events

use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::failure::FailureCategory;

/// Why a bulkhead turned a caller away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadRejection {
    QueueFull,
    QueueTimeout { waited: Duration },
}

/// One observable recovery decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    RetryAttempted {
        category: FailureCategory,
        attempt: usize,
        delay: Duration,
    },
    StrategyFailed {
        strategy: String,
        message: String,
        elapsed: Duration,
    },
    DegradationEntered {
        level: usize,
        level_type: String,
    },
    BulkheadRejected {
        resource_class: String,
        rejection: BulkheadRejection,
    },
    SagaCompensationFailed {
        saga: String,
        step: String,
        message: String,
    },
    DeadlineExceeded {
        total_deadline: Duration,
        elapsed: Duration,
    },
}

impl ResilienceEvent {
    /// The component that emitted this event.
    pub fn component(&self) -> &'static str {
        match self {
            ResilienceEvent::RetryAttempted { .. } => "retry",
            ResilienceEvent::StrategyFailed { .. } => "strategy-chain",
            ResilienceEvent::DegradationEntered { .. } => "degradation-ladder",
            ResilienceEvent::BulkheadRejected { .. } => "bulkhead",
            ResilienceEvent::SagaCompensationFailed { .. } => "saga",
            ResilienceEvent::DeadlineExceeded { .. } => "deadline-runner",
        }
    }
}

/// Receives every event a runner emits. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ResilienceEvent);
}

/// Default sink: renders each event as a structured tracing record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ResilienceEvent) {
        match &event {
            ResilienceEvent::RetryAttempted {
                category,
                attempt,
                delay,
            } => {
                info!(component = event.component(), %category, attempt, ?delay, "retry attempted")
            }
            ResilienceEvent::StrategyFailed {
                strategy,
                message,
                elapsed,
            } => {
                warn!(component = event.component(), %strategy, %message, ?elapsed, "strategy failed")
            }
            ResilienceEvent::DegradationEntered { level, level_type } => {
                warn!(component = event.component(), level, %level_type, "degradation level entered")
            }
            ResilienceEvent::BulkheadRejected {
                resource_class,
                rejection,
            } => {
                warn!(component = event.component(), %resource_class, ?rejection, "bulkhead rejected")
            }
            ResilienceEvent::SagaCompensationFailed { saga, step, message } => {
                warn!(component = event.component(), %saga, %step, %message, "saga compensation failed")
            }
            ResilienceEvent::DeadlineExceeded {
                total_deadline,
                elapsed,
            } => {
                warn!(component = event.component(), ?total_deadline, ?elapsed, "deadline exceeded")
            }
        }
    }
}

/// Captures events in memory. Intended for tests and integration probes.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }

    pub fn take(&self) -> Vec<ResilienceEvent> {
        std::mem::take(&mut *self.events.lock().expect("sink poisoned"))
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: ResilienceEvent) {
        self.events.lock().expect("sink poisoned").push(event);
    }
}
