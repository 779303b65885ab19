//! Ordered alternative strategies for one goal.
//!
//! What this module provides
//! - A chain that tries equivalent means of achieving the identical result,
//!   in order, under per-strategy timeouts, until one produces a valid value
//!
//! Exports
//! - Models
//!   - `Strategy<Req, Res>` trait: `can_handle`, `execute`, optional timeout
//!   - `FnStrategy` plus `strategy_fn` sugar for closure-backed strategies
//! - Runners
//!   - `StrategyChain<Req, Res>` built from an ordered strategy list
//!
//! Implementation strategy
//! - Race each strategy against its timeout; a timeout or an invalid result
//!   moves to the next strategy, a classified-fatal failure halts the chain
//! - Exhaustion surfaces an aggregate error naming every attempt
//!
//! Testing strategy
//! - Scripted strategies failing in known patterns; assert order, halt
//!   conditions, and the aggregate error contents

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ResilienceError, Result, StrategyAttempt};
use crate::events::{EventSink, ResilienceEvent, TracingSink};
use crate::failure::{default_classifier, Failure, FailureClassifier};
use crate::retry::PolicyRegistry;

/// One way of achieving the chain's goal.
#[async_trait]
pub trait Strategy<Req, Res>: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this strategy applies to the request. Skipped strategies do
    /// not count as failed attempts.
    fn can_handle(&self, _request: &Req) -> bool {
        true
    }

    /// Per-strategy timeout, overriding the chain default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, request: &Req) -> std::result::Result<Res, Failure>;
}

/// A strategy backed by a closure. Built via [`strategy_fn`].
pub struct FnStrategy<Req, F> {
    name: String,
    timeout: Option<Duration>,
    guard: Option<Box<dyn Fn(&Req) -> bool + Send + Sync>>,
    f: F,
}

impl<Req, F> FnStrategy<Req, F> {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Gate this strategy on a predicate over the request.
    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: Fn(&Req) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }
}

/// DX sugar: create a strategy from an async closure taking the request by
/// value.
pub fn strategy_fn<Req, Res, F, Fut>(name: impl Into<String>, f: F) -> FnStrategy<Req, F>
where
    Req: Clone + Send + Sync,
    Res: Send,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Res, Failure>> + Send,
{
    FnStrategy {
        name: name.into(),
        timeout: None,
        guard: None,
        f,
    }
}

#[async_trait]
impl<Req, Res, F, Fut> Strategy<Req, Res> for FnStrategy<Req, F>
where
    Req: Clone + Send + Sync,
    Res: Send,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Res, Failure>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, request: &Req) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(request))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, request: &Req) -> std::result::Result<Res, Failure> {
        (self.f)(request.clone()).await
    }
}

type Validator<Res> = Arc<dyn Fn(&Res) -> bool + Send + Sync>;

/// Tries each strategy in turn until one produces a valid result.
pub struct StrategyChain<Req, Res> {
    strategies: Vec<Arc<dyn Strategy<Req, Res>>>,
    default_timeout: Duration,
    validator: Option<Validator<Res>>,
    classifier: Arc<dyn FailureClassifier>,
    registry: PolicyRegistry,
    sink: Arc<dyn EventSink>,
}

impl<Req, Res> StrategyChain<Req, Res>
where
    Req: Send + Sync,
    Res: Send,
{
    pub fn builder() -> StrategyChainBuilder<Req, Res> {
        StrategyChainBuilder::new()
    }

    /// Runs the chain. An empty chain is a configuration error and fails
    /// immediately.
    pub async fn execute(&self, request: Req) -> Result<Res> {
        if self.strategies.is_empty() {
            return Err(ResilienceError::NoStrategies);
        }

        let mut attempts: Vec<StrategyAttempt> = Vec::new();

        for strategy in &self.strategies {
            let name = strategy.name().to_string();
            if !strategy.can_handle(&request) {
                debug!(strategy = %name, "strategy does not apply, skipping");
                continue;
            }

            let limit = strategy.timeout().unwrap_or(self.default_timeout);
            let started = Instant::now();

            let failure = match tokio::time::timeout(limit, strategy.execute(&request)).await {
                Ok(Ok(result)) => {
                    let valid = self.validator.as_ref().map_or(true, |v| v(&result));
                    if valid {
                        debug!(strategy = %name, elapsed = ?started.elapsed(), "strategy succeeded");
                        return Ok(result);
                    }
                    // An invalid result moves on like a timeout would; the
                    // chain produced the verdict, not the strategy.
                    Failure::new(format!("strategy '{name}' produced an invalid result"))
                }
                Ok(Err(failure)) => {
                    if self.is_fatal(&failure) {
                        self.record_failure(&name, &failure, started.elapsed());
                        warn!(strategy = %name, %failure, "fatal failure halts the chain");
                        return Err(ResilienceError::FatalStrategyFailure {
                            strategy: name,
                            failure,
                            attempts,
                        });
                    }
                    failure
                }
                Err(_) => Failure::timeout(format!("strategy '{name}'"), limit),
            };

            self.record_failure(&name, &failure, started.elapsed());
            attempts_push(&mut attempts, &name, &failure);
        }

        Err(ResilienceError::StrategiesExhausted { attempts })
    }

    /// A failure halts the chain when it is critical, unclassified, or its
    /// category has no registered policy.
    fn is_fatal(&self, failure: &Failure) -> bool {
        if failure.is_critical() {
            return true;
        }
        match self.classifier.classify(failure) {
            None => true,
            Some(category) => !self.registry.is_retryable(category),
        }
    }

    fn record_failure(&self, strategy: &str, failure: &Failure, elapsed: Duration) {
        self.sink.record(ResilienceEvent::StrategyFailed {
            strategy: strategy.to_string(),
            message: failure.to_string(),
            elapsed,
        });
    }
}

fn attempts_push(attempts: &mut Vec<StrategyAttempt>, strategy: &str, failure: &Failure) {
    attempts.push(StrategyAttempt {
        strategy: strategy.to_string(),
        failure: failure.clone(),
    });
}

impl<Req, Res> fmt::Debug for StrategyChain<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyChain")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

pub struct StrategyChainBuilder<Req, Res> {
    strategies: Vec<Arc<dyn Strategy<Req, Res>>>,
    default_timeout: Duration,
    validator: Option<Validator<Res>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    registry: Option<PolicyRegistry>,
    sink: Option<Arc<dyn EventSink>>,
}

impl<Req, Res> StrategyChainBuilder<Req, Res>
where
    Req: Send + Sync,
    Res: Send,
{
    fn new() -> Self {
        Self {
            strategies: Vec::new(),
            default_timeout: Duration::from_secs(30),
            validator: None,
            classifier: None,
            registry: None,
            sink: None,
        }
    }

    pub fn strategy(mut self, strategy: impl Strategy<Req, Res> + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Validate each candidate result; invalid results fall through to the
    /// next strategy.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Res) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Registry consulted for the continue/halt decision: categories with no
    /// registered policy halt the chain.
    pub fn registry(mut self, registry: PolicyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> StrategyChain<Req, Res> {
        StrategyChain {
            strategies: self.strategies,
            default_timeout: self.default_timeout,
            validator: self.validator,
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(default_classifier())),
            registry: self.registry.unwrap_or_default(),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureCategory;
    use crate::retry::ExponentialBackoff;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn retryable_registry() -> PolicyRegistry {
        PolicyRegistry::new().register(
            FailureCategory::TransientNetwork,
            ExponentialBackoff::new(3, Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn empty_chain_is_a_configuration_error() {
        let chain: StrategyChain<(), ()> = StrategyChain::builder().build();
        let result = chain.execute(()).await;
        assert!(matches!(result, Err(ResilienceError::NoStrategies)));
    }

    #[tokio::test]
    async fn first_working_strategy_wins() {
        let tried = Arc::new(AtomicUsize::new(0));
        let tried_a = tried.clone();
        let tried_b = tried.clone();

        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .strategy(strategy_fn("broken-mirror", move |_req: String| {
                tried_a.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<String, _>(Failure::with_category(
                        FailureCategory::TransientNetwork,
                        "connection reset",
                    ))
                }
            }))
            .strategy(strategy_fn("healthy-mirror", move |req: String| {
                tried_b.fetch_add(1, Ordering::SeqCst);
                async move { Ok(format!("{req}: ok")) }
            }))
            .build();

        let result = chain.execute("fetch".to_string()).await.unwrap();
        assert_eq!(result, "fetch: ok");
        assert_eq!(tried.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn skipped_strategies_are_not_attempts() {
        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .strategy(
                strategy_fn("large-only", |_req: usize| async {
                    Ok::<&str, Failure>("large")
                })
                .with_guard(|req| *req > 100),
            )
            .strategy(strategy_fn("any", |_req: usize| async {
                Ok::<&str, Failure>("any")
            }))
            .build();

        assert_eq!(chain.execute(5).await.unwrap(), "any");
        assert_eq!(chain.execute(500).await.unwrap(), "large");
    }

    #[tokio::test]
    async fn timeout_falls_through_to_next_strategy() {
        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .default_timeout(Duration::from_millis(20))
            .strategy(strategy_fn("slow", |_req: ()| async {
                sleep(Duration::from_millis(200)).await;
                Ok::<&str, Failure>("slow")
            }))
            .strategy(strategy_fn("fast", |_req: ()| async {
                Ok::<&str, Failure>("fast")
            }))
            .build();

        assert_eq!(chain.execute(()).await.unwrap(), "fast");
    }

    #[tokio::test]
    async fn invalid_result_falls_through() {
        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .validator(|res: &String| !res.is_empty())
            .strategy(strategy_fn("empty", |_req: ()| async {
                Ok::<String, Failure>(String::new())
            }))
            .strategy(strategy_fn("real", |_req: ()| async {
                Ok::<String, Failure>("payload".into())
            }))
            .build();

        assert_eq!(chain.execute(()).await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn critical_failure_halts_the_chain() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_cl = reached.clone();

        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .strategy(strategy_fn("poisoned", |_req: ()| async {
                Err::<(), _>(Failure::critical("data corrupted upstream"))
            }))
            .strategy(strategy_fn("never-reached", move |_req: ()| {
                reached_cl.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
            .build();

        let err = chain.execute(()).await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::FatalStrategyFailure { ref strategy, .. } if strategy == "poisoned"
        ));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_retryable_category_halts_the_chain() {
        // Validation has no policy in the registry, so it is not recoverable
        // by trying another strategy.
        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .strategy(strategy_fn("strict", |_req: ()| async {
                Err::<(), _>(Failure::with_category(
                    FailureCategory::Validation,
                    "malformed request",
                ))
            }))
            .strategy(strategy_fn("fallback", |_req: ()| async { Ok(()) }))
            .build();

        assert!(matches!(
            chain.execute(()).await,
            Err(ResilienceError::FatalStrategyFailure { .. })
        ));
    }

    #[tokio::test]
    async fn exhaustion_names_every_attempt() {
        let chain = StrategyChain::builder()
            .registry(retryable_registry())
            .strategy(strategy_fn("mirror-a", |_req: ()| async {
                Err::<(), _>(Failure::with_category(
                    FailureCategory::TransientNetwork,
                    "reset",
                ))
            }))
            .strategy(strategy_fn("mirror-b", |_req: ()| async {
                Err::<(), _>(Failure::with_category(
                    FailureCategory::TransientNetwork,
                    "refused",
                ))
            }))
            .build();

        match chain.execute(()).await.unwrap_err() {
            ResilienceError::StrategiesExhausted { attempts } => {
                let names: Vec<_> = attempts.iter().map(|a| a.strategy.as_str()).collect();
                assert_eq!(names, vec!["mirror-a", "mirror-b"]);
            }
            other => panic!("expected StrategiesExhausted, got {other:?}"),
        }
    }
}
