//! Reconciler seam and the worker pool that drives it.

use async_trait::async_trait;
use hs_types::{HsResult, ObjectKey};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;

/// Event reason recorded when a reconcile pass returns an error.
pub const RECONCILE_FAILED_REASON: &str = "ReconcileFailed";

/// One idempotent reconciliation pass over the record at a key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind of record this reconciler owns, used in logs.
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> HsResult<()>;
}

/// A reconciler, its work queue and its workers.
pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        let queue = Arc::new(WorkQueue::new(reconciler.kind()));
        Self {
            reconciler,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn kind(&self) -> &'static str {
        self.reconciler.kind()
    }

    /// Spawn the workers. They exit once `shutdown` flips to `true` or the
    /// queue shuts down, finishing any pass already under way.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(controller = self.kind(), workers = self.workers, "starting workers");
        (0..self.workers)
            .map(|worker| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = Arc::clone(&self.queue);
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(worker, reconciler, queue, shutdown))
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = reconciler.kind();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let key = tokio::select! {
            key = queue.get() => key,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let Some(key) = key else {
            break;
        };

        debug!(controller = kind, worker, key = %key, "reconciling");
        match reconciler.reconcile(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                warn!(
                    controller = kind,
                    key = %key,
                    error = %e,
                    retryable = e.is_retryable(),
                    "reconcile failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(controller = kind, worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::internal_error;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Fails each key a fixed number of times before succeeding.
    struct Flaky {
        failures_left: Mutex<u32>,
        passes: Mutex<Vec<ObjectKey>>,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn kind(&self) -> &'static str {
            "Flaky"
        }

        async fn reconcile(&self, key: &ObjectKey) -> HsResult<()> {
            self.passes.lock().push(key.clone());
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(internal_error!("transient failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_pass_is_retried_until_success() {
        let flaky = Arc::new(Flaky {
            failures_left: Mutex::new(2),
            passes: Mutex::new(Vec::new()),
        });
        let controller = Controller::new(flaky.clone(), 2);
        let (tx, rx) = watch::channel(false);
        let handles = controller.spawn(rx);

        let key = ObjectKey::new("default", "mnist");
        controller.queue().add(key.clone());

        for _ in 0..200 {
            if flaky.passes.lock().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(flaky.passes.lock().len(), 3);
        assert_eq!(controller.queue().failures(&key), 0);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
