//! Staged graceful degradation.
//!
//! What this module provides
//! - An ordered ladder of reduced-fidelity fallbacks, gated by feature
//!   flags and health checks, used when the primary operation is
//!   unavailable rather than merely slow
//!
//! Exports
//! - Models
//!   - `DegradationLevel<T>` (level type, operation, gating, notification)
//!   - `DegradationOutcome<T>` reporting which level served the request
//! - Collaborators
//!   - `FeatureFlags`, `HealthMonitor` (constructor-injected)
//! - Runners
//!   - `DegradationLadder<T>`
//!
//! Implementation strategy
//! - Try the primary; on failure walk the levels in order, skipping gated
//!   levels without counting them as failed attempts
//! - Surface the level's user notification with the result so callers can
//!   show "using backup" messaging without internal failure detail
//!
//! Testing strategy
//! - Fake flag/health collaborators; assert gating skips, level ordering,
//!   and the aggregate unavailable error

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::failure::Failure;
use crate::{op_fn, OpFn};

/// Feature flag lookup. Absent collaborator means gates pass.
pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Aggregate health verdict for a set of resources.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub is_healthy: bool,
}

/// Health lookup for the resources a level depends on.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn check_health(&self, resources: &[String]) -> HealthStatus;
}

/// One rung of the ladder: a reduced-fidelity operation and its gating.
pub struct DegradationLevel<T> {
    level_type: String,
    operation: OpFn<T>,
    feature_flag: Option<String>,
    health_requirement: Vec<String>,
    user_notification: Option<String>,
}

impl<T> DegradationLevel<T> {
    pub fn new<F, Fut>(level_type: impl Into<String>, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
    {
        Self {
            level_type: level_type.into(),
            operation: op_fn(operation),
            feature_flag: None,
            health_requirement: Vec::new(),
            user_notification: None,
        }
    }

    pub fn feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }

    pub fn requires_healthy(mut self, resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.health_requirement = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn notify_user(mut self, message: impl Into<String>) -> Self {
        self.user_notification = Some(message.into());
        self
    }

    pub fn level_type(&self) -> &str {
        &self.level_type
    }
}

impl<T> fmt::Debug for DegradationLevel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationLevel")
            .field("level_type", &self.level_type)
            .field("feature_flag", &self.feature_flag)
            .field("health_requirement", &self.health_requirement)
            .finish()
    }
}

/// The served result plus which level produced it. `degradation_level` is 0
/// for the primary, 1-based for ladder levels.
#[derive(Debug, Clone)]
pub struct DegradationOutcome<T> {
    pub result: T,
    pub degradation_level: usize,
    pub degraded: bool,
    pub degradation_type: Option<String>,
    pub user_notification: Option<String>,
}

/// Walks the ladder when the primary operation fails.
pub struct DegradationLadder<T> {
    levels: Vec<DegradationLevel<T>>,
    flags: Option<Arc<dyn FeatureFlags>>,
    health: Option<Arc<dyn HealthMonitor>>,
    sink: Arc<dyn EventSink>,
}

impl<T> DegradationLadder<T> {
    pub fn builder() -> DegradationLadderBuilder<T> {
        DegradationLadderBuilder::new()
    }

    /// Try the primary, then each gated level in order.
    pub async fn execute<F, Fut>(&self, primary: F) -> Result<DegradationOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        match primary().await {
            Ok(result) => {
                return Ok(DegradationOutcome {
                    result,
                    degradation_level: 0,
                    degraded: false,
                    degradation_type: None,
                    user_notification: None,
                })
            }
            Err(failure) => {
                warn!(%failure, "primary operation failed, walking degradation ladder");
            }
        }

        let mut attempted: Vec<String> = Vec::new();

        for (index, level) in self.levels.iter().enumerate() {
            if !self.gates_open(level).await {
                debug!(level_type = %level.level_type, "level gated off, skipping");
                continue;
            }

            let degradation_level = index + 1;
            self.sink.record(ResilienceEvent::DegradationEntered {
                level: degradation_level,
                level_type: level.level_type.clone(),
            });
            attempted.push(level.level_type.clone());

            match (level.operation)().await {
                Ok(result) => {
                    return Ok(DegradationOutcome {
                        result,
                        degradation_level,
                        degraded: true,
                        degradation_type: Some(level.level_type.clone()),
                        user_notification: level.user_notification.clone(),
                    })
                }
                Err(failure) => {
                    warn!(level_type = %level.level_type, %failure, "degradation level failed");
                }
            }
        }

        Err(ResilienceError::ServiceUnavailable { attempted })
    }

    async fn gates_open(&self, level: &DegradationLevel<T>) -> bool {
        if let Some(flag) = &level.feature_flag {
            if let Some(flags) = &self.flags {
                if !flags.is_enabled(flag) {
                    return false;
                }
            }
        }
        if !level.health_requirement.is_empty() {
            if let Some(health) = &self.health {
                if !health.check_health(&level.health_requirement).await.is_healthy {
                    return false;
                }
            }
        }
        true
    }
}

pub struct DegradationLadderBuilder<T> {
    levels: Vec<DegradationLevel<T>>,
    flags: Option<Arc<dyn FeatureFlags>>,
    health: Option<Arc<dyn HealthMonitor>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl<T> DegradationLadderBuilder<T> {
    fn new() -> Self {
        Self {
            levels: Vec::new(),
            flags: None,
            health: None,
            sink: None,
        }
    }

    pub fn level(mut self, level: DegradationLevel<T>) -> Self {
        self.levels.push(level);
        self
    }

    pub fn feature_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> DegradationLadder<T> {
        DegradationLadder {
            levels: self.levels,
            flags: self.flags,
            health: self.health,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}
