//! Tower middleware adapters for the runners.
//!
//! What this module provides
//! - `Layer`/`Service` pairs so callers already composing Tower stacks can
//!   apply the framework at the service level
//!
//! Exports
//! - Layers
//!   - `RetryLayer` driving a `RetryExecutor` around the inner service
//!   - `TimeoutLayer` racing calls against a fixed limit
//!   - `BulkheadLayer` forcing calls through a shared `Bulkhead`
//!
//! Composition
//! - Layered services keep `Failure` as their error type, so layers stack
//!   in any order:
//!   `ServiceBuilder::new().layer(bulkhead).layer(retry).service(inner)`
//!
//! Testing strategy
//! - `service_fn` fakes erroring in scripted patterns; assert retry counts,
//!   timeout surfacing, and bulkhead saturation behavior through the stack

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tower::{Layer, Service, ServiceExt};

use crate::bulkhead::Bulkhead;
use crate::failure::Failure;
use crate::retry::RetryExecutor;

type ServiceFuture<T> = Pin<Box<dyn Future<Output = Result<T, Failure>> + Send>>;

// ===== Retry =====

/// Applies a [`RetryExecutor`]'s classify/decide/backoff loop to a service.
#[derive(Clone)]
pub struct RetryLayer {
    executor: Arc<RetryExecutor>,
}

impl RetryLayer {
    pub fn new(executor: RetryExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    executor: Arc<RetryExecutor>,
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            executor: self.executor.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Retry<S>
where
    Req: Clone + Send + Sync + 'static,
    S: Service<Req, Error = Failure> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = Failure;
    type Future = ServiceFuture<S::Response>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();
        Box::pin(async move {
            executor
                .execute(|| {
                    let inner = inner.clone();
                    let req = req.clone();
                    async move {
                        let mut guard = inner.lock().await;
                        ServiceExt::ready(&mut *guard).await?.call(req).await
                    }
                })
                .await
                .map_err(Failure::from)
        })
    }
}

// ===== Timeout =====

/// Races each call against a fixed limit.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    limit: Duration,
}

impl TimeoutLayer {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

pub struct Timeout<S> {
    inner: S,
    limit: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            limit: self.limit,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = Failure> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = Failure;
    type Future = ServiceFuture<S::Response>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limit = self.limit;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(Failure::timeout("service call", limit)),
            }
        })
    }
}

// ===== Bulkhead =====

/// Forces every call through a shared [`Bulkhead`]'s slot pool.
#[derive(Clone)]
pub struct BulkheadLayer {
    bulkhead: Arc<Bulkhead>,
}

impl BulkheadLayer {
    pub fn new(bulkhead: Arc<Bulkhead>) -> Self {
        Self { bulkhead }
    }
}

pub struct Isolated<S> {
    inner: Arc<Mutex<S>>,
    bulkhead: Arc<Bulkhead>,
}

impl<S> Layer<S> for BulkheadLayer {
    type Service = Isolated<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Isolated {
            inner: Arc::new(Mutex::new(inner)),
            bulkhead: self.bulkhead.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Isolated<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = Failure> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = Failure;
    type Future = ServiceFuture<S::Response>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let bulkhead = self.bulkhead.clone();
        Box::pin(async move {
            bulkhead
                .execute(|| async move {
                    let mut guard = inner.lock().await;
                    ServiceExt::ready(&mut *guard).await?.call(req).await
                })
                .await
                .map_err(Failure::from)
        })
    }
}
