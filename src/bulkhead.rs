//! Per-resource-class concurrency isolation.
//!
//! What this module provides
//! - A bounded execution slot pool per resource class, so one overloaded
//!   dependency cannot exhaust shared capacity
//!
//! Exports
//! - Runners
//!   - `Bulkhead` constructed from a `BulkheadConfig` and a resource class
//!     name, exposing `execute()` plus `active_count`/`queued_count` probes
//!
//! Implementation strategy
//! - A FIFO-fair `tokio::sync::Semaphore` gates the slots; released permits
//!   go to the longest waiter, so queued callers are served strictly in
//!   arrival order
//! - An atomic queued counter enforces the queue bound with immediate
//!   rejection; a queued caller races its wait against the queue timeout,
//!   and dropping the acquire future removes it from the wait list
//! - Slot accounting is guard-based: the permit and the active counter are
//!   released on every exit path, including panics
//!
//! Testing strategy
//! - Saturate with slow operations and assert the 2-run/1-queue/1-reject
//!   split, FIFO service order, and that probes never exceed the limits

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::future::Future;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BulkheadConfig;
use crate::error::{ResilienceError, Result};
use crate::events::{BulkheadRejection, EventSink, ResilienceEvent, TracingSink};
use crate::failure::Failure;

/// Concurrency limiter for one resource class.
pub struct Bulkhead {
    resource_class: String,
    config: BulkheadConfig,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    sink: Arc<dyn EventSink>,
}

impl Bulkhead {
    pub fn new(resource_class: impl Into<String>, config: BulkheadConfig) -> Self {
        Self::with_sink(resource_class, config, Arc::new(TracingSink))
    }

    pub fn with_sink(
        resource_class: impl Into<String>,
        config: BulkheadConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            resource_class: resource_class.into(),
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            sink,
        }
    }

    pub fn resource_class(&self) -> &str {
        &self.resource_class
    }

    /// Operations currently holding a slot. Never exceeds `max_concurrent`.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Callers currently waiting for a slot. Never exceeds `max_queue_size`.
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Runs the operation inside a slot, queueing when saturated.
    ///
    /// Saturated with a full queue rejects immediately; a queued caller
    /// whose wait outlives `queue_timeout` is rejected without ever holding
    /// a slot.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => self.wait_for_slot().await?,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let _slot = SlotGuard {
            active: &self.active,
            _permit: permit,
        };

        match self.config.operation_timeout {
            Some(limit) => match timeout(limit, operation()).await {
                Ok(outcome) => outcome.map_err(ResilienceError::from),
                Err(_) => Err(ResilienceError::Timeout {
                    name: self.resource_class.clone(),
                    limit,
                }),
            },
            None => operation().await.map_err(ResilienceError::from),
        }
    }

    async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit> {
        let admitted = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < self.config.max_queue_size).then_some(queued + 1)
            })
            .is_ok();

        if !admitted {
            warn!(resource_class = %self.resource_class, "queue full, rejecting");
            self.sink.record(ResilienceEvent::BulkheadRejected {
                resource_class: self.resource_class.clone(),
                rejection: BulkheadRejection::QueueFull,
            });
            return Err(ResilienceError::BulkheadRejected {
                resource_class: self.resource_class.clone(),
                max_queue_size: self.config.max_queue_size,
            });
        }

        let _queued = QueueGuard { queued: &self.queued };
        debug!(resource_class = %self.resource_class, "queued for a slot");

        match timeout(self.config.queue_timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed.
            Ok(Err(_)) => Err(ResilienceError::Failure(Failure::critical(
                "bulkhead semaphore closed",
            ))),
            Err(_) => {
                // Losing the race dropped the acquire future, which removed
                // this caller from the wait list before anyone could hand it
                // a permit.
                warn!(resource_class = %self.resource_class, "queue timeout");
                self.sink.record(ResilienceEvent::BulkheadRejected {
                    resource_class: self.resource_class.clone(),
                    rejection: BulkheadRejection::QueueTimeout {
                        waited: self.config.queue_timeout,
                    },
                });
                Err(ResilienceError::BulkheadQueueTimeout {
                    resource_class: self.resource_class.clone(),
                    waited: self.config.queue_timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("resource_class", &self.resource_class)
            .field("max_concurrent", &self.config.max_concurrent)
            .field("max_queue_size", &self.config.max_queue_size)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

struct SlotGuard<'a> {
    active: &'a AtomicUsize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueueGuard<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config(max_concurrent: usize, max_queue_size: usize) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent,
            max_queue_size,
            queue_timeout: Duration::from_millis(200),
            operation_timeout: None,
        }
    }

    #[tokio::test]
    async fn runs_within_capacity() {
        let bulkhead = Bulkhead::new("db", config(2, 1));
        let result = bulkhead.execute(|| async { Ok::<_, Failure>(5) }).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn saturation_splits_run_queue_reject() {
        let bulkhead = Arc::new(Bulkhead::new("image-api", config(2, 1)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bulkhead = bulkhead.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        sleep(Duration::from_millis(100)).await;
                        Ok::<_, Failure>(())
                    })
                    .await
            }));
        }

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(ResilienceError::BulkheadRejected { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        // 2 run immediately, 1 queues and then runs, 1 is turned away.
        assert_eq!(ok, 3);
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn active_count_never_exceeds_limit() {
        let bulkhead = Arc::new(Bulkhead::new("probe", config(2, 8)));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bulkhead = bulkhead.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        sleep(Duration::from_millis(30)).await;
                        Ok::<_, Failure>(())
                    })
                    .await
            }));
        }

        for _ in 0..20 {
            assert!(bulkhead.active_count() <= 2);
            assert!(bulkhead.queued_count() <= 8);
            sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn queue_timeout_rejects_waiter() {
        let bulkhead = Arc::new(Bulkhead::new(
            "slow-pool",
            BulkheadConfig {
                max_concurrent: 1,
                max_queue_size: 1,
                queue_timeout: Duration::from_millis(20),
                operation_timeout: None,
            },
        ));

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        sleep(Duration::from_millis(150)).await;
                        Ok::<_, Failure>(())
                    })
                    .await
            })
        };
        // Let the holder take the slot first.
        sleep(Duration::from_millis(10)).await;

        let err = bulkhead
            .execute(|| async { Ok::<_, Failure>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::BulkheadQueueTimeout { .. }));
        assert_eq!(bulkhead.queued_count(), 0);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slot_released_on_operation_failure() {
        let bulkhead = Bulkhead::new("flaky", config(1, 0));

        let err = bulkhead
            .execute(|| async { Err::<(), _>(Failure::new("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Failure(_)));

        // The slot is free again.
        let ok = bulkhead.execute(|| async { Ok::<_, Failure>(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn operation_timeout_inside_slot() {
        let bulkhead = Bulkhead::new(
            "timed",
            BulkheadConfig {
                max_concurrent: 1,
                max_queue_size: 0,
                queue_timeout: Duration::from_millis(10),
                operation_timeout: Some(Duration::from_millis(20)),
            },
        );

        let err = bulkhead
            .execute(|| async {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, Failure>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn rejection_emits_event() {
        let sink = Arc::new(MemorySink::new());
        let bulkhead = Arc::new(Bulkhead::with_sink(
            "evented",
            BulkheadConfig {
                max_concurrent: 1,
                max_queue_size: 0,
                queue_timeout: Duration::from_millis(10),
                operation_timeout: None,
            },
            sink.clone(),
        ));

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        sleep(Duration::from_millis(80)).await;
                        Ok::<_, Failure>(())
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let _ = bulkhead.execute(|| async { Ok::<_, Failure>(()) }).await;
        holder.await.unwrap().unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ResilienceEvent::BulkheadRejected {
                rejection: BulkheadRejection::QueueFull,
                ..
            }
        ));
    }
}
