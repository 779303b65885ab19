//! Classified retry with exponential backoff.
//!
//! The executor drives the loop: execute, classify the failure, ask the
//! category's policy for a decision, wait, retry. Termination rests on the
//! policies: every policy caps its attempts, and categories without a
//! registered policy are fatal on first failure.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{RetryPolicyConfig, RetryTableConfig};
use crate::error::Result;
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::failure::{default_classifier, Failure, FailureCategory, FailureClassifier};
use crate::sleeper::{Sleeper, TokioSleeper};

/// An async action run after the backoff delay, before the next attempt
/// (a connectivity probe, a cache flush). A failing action consumes one
/// attempt, classified like an operation failure.
pub type PreRetryAction =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), Failure>> + Send + Sync>;

/// A policy's answer for one attempt. Computed fresh each time, never
/// persisted.
#[derive(Clone)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub pre_retry_action: Option<PreRetryAction>,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            pre_retry_action: None,
        }
    }

    pub fn retry_in(delay: Duration) -> Self {
        Self {
            retry: true,
            delay,
            pre_retry_action: None,
        }
    }
}

impl fmt::Debug for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryDecision")
            .field("retry", &self.retry)
            .field("delay", &self.delay)
            .field(
                "pre_retry_action",
                &self.pre_retry_action.as_ref().map(|_| "<action>"),
            )
            .finish()
    }
}

/// Decides, per attempt, whether to retry, how long to wait, and what to
/// run before the next attempt. `attempt` counts retries already performed
/// (0 on the first failure). Implementations MUST bound attempts.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, failure: &Failure, attempt: usize) -> RetryDecision;
}

/// Exponential backoff with jitter:
/// `delay = base * 2^attempt + random(0, jitter_max)`, clamped to
/// `max_delay` when set. A failure carrying an explicit retry-after hint is
/// honored verbatim.
#[derive(Clone)]
pub struct ExponentialBackoff {
    max_attempts: usize,
    base_delay: Duration,
    jitter_max: Duration,
    max_delay: Option<Duration>,
    pre_retry_action: Option<PreRetryAction>,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter_max: Duration::ZERO,
            max_delay: None,
            pre_retry_action: None,
        }
    }

    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            jitter_max: config.jitter_max,
            max_delay: config.max_delay,
            pre_retry_action: None,
        }
    }

    pub fn with_jitter(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_pre_retry_action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        self.pre_retry_action = Some(Arc::new(move || Box::pin(action())));
        self
    }

    /// Deterministic part of the delay for an attempt, before jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(20) as u32;
        let delay = self.base_delay.saturating_mul(factor);
        match self.max_delay {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(&self, failure: &Failure, attempt: usize) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::stop();
        }
        let delay = match failure.retry_after() {
            // A rate-limit style hint is honored verbatim.
            Some(hint) => hint,
            None => self.delay_for_attempt(attempt) + jitter(self.jitter_max),
        };
        RetryDecision {
            retry: true,
            delay,
            pre_retry_action: self.pre_retry_action.clone(),
        }
    }
}

/// Maps each failure category to its retry policy. Categories absent from
/// the registry are not retryable.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<FailureCategory, Arc<dyn RetryPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(table: &RetryTableConfig) -> Self {
        let mut registry = Self::new();
        for (category, config) in &table.policies {
            registry = registry.register(*category, ExponentialBackoff::from_config(config));
        }
        registry
    }

    pub fn register(
        mut self,
        category: FailureCategory,
        policy: impl RetryPolicy + 'static,
    ) -> Self {
        self.policies.insert(category, Arc::new(policy));
        self
    }

    pub fn get(&self, category: FailureCategory) -> Option<&Arc<dyn RetryPolicy>> {
        self.policies.get(&category)
    }

    pub fn is_retryable(&self, category: FailureCategory) -> bool {
        self.policies.contains_key(&category)
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("categories", &self.policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Drives the retry loop with a classifier and a policy registry.
#[derive(Clone)]
pub struct RetryExecutor {
    classifier: Arc<dyn FailureClassifier>,
    registry: PolicyRegistry,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl RetryExecutor {
    pub fn builder() -> RetryExecutorBuilder {
        RetryExecutorBuilder::default()
    }

    /// An executor using the default classifier and the given policy table.
    pub fn from_config(table: &RetryTableConfig) -> Self {
        Self::builder()
            .registry(PolicyRegistry::from_config(table))
            .build()
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn classifier(&self) -> &Arc<dyn FailureClassifier> {
        &self.classifier
    }

    /// Executes the operation until it succeeds, its category's policy stops
    /// retrying, or the failure is fatal (critical, unclassified, or a
    /// category with no registered policy).
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let mut attempt = 0usize;
        let mut hint_honored = false;
        let mut outcome = operation().await;

        loop {
            let failure = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if failure.is_critical() {
                debug!(%failure, "critical failure is not retryable");
                return Err(failure.into());
            }

            let Some(category) = self.classifier.classify(&failure) else {
                debug!(%failure, "unclassified failure is fatal");
                return Err(failure.into());
            };
            let failure = failure.ensure_category(category);

            let Some(policy) = self.registry.get(category) else {
                debug!(%category, "no retry policy registered");
                return Err(failure.into());
            };

            // A retry-after hint grants exactly one further attempt.
            if failure.retry_after().is_some() {
                if hint_honored {
                    warn!(%category, "retry-after hint already honored");
                    return Err(failure.into());
                }
                hint_honored = true;
            }

            let decision = policy.decide(&failure, attempt);
            if !decision.retry {
                warn!(%category, attempts = attempt + 1, %failure, "retries exhausted");
                return Err(failure.into());
            }

            self.sink.record(ResilienceEvent::RetryAttempted {
                category,
                attempt,
                delay: decision.delay,
            });
            debug!(%category, attempt, delay = ?decision.delay, "retrying after delay");
            self.sleeper.sleep(decision.delay).await;
            attempt += 1;

            if let Some(action) = decision.pre_retry_action {
                if let Err(action_failure) = action().await {
                    // A failed probe consumes the attempt it preceded.
                    warn!(%action_failure, "pre-retry action failed");
                    outcome = Err(action_failure);
                    continue;
                }
            }

            outcome = operation().await;
        }
    }
}

#[derive(Default)]
pub struct RetryExecutorBuilder {
    classifier: Option<Arc<dyn FailureClassifier>>,
    registry: Option<PolicyRegistry>,
    sleeper: Option<Arc<dyn Sleeper>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RetryExecutorBuilder {
    pub fn classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn registry(mut self, registry: PolicyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn policy(mut self, category: FailureCategory, policy: impl RetryPolicy + 'static) -> Self {
        let registry = self.registry.take().unwrap_or_default();
        self.registry = Some(registry.register(category, policy));
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> RetryExecutor {
        RetryExecutor {
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(default_classifier())),
            registry: self.registry.unwrap_or_default(),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}
