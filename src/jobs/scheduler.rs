//! Fixed-size worker pool draining the registry's tier queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::JobRegistry;
use super::worker::{Worker, WorkerDeps};

/// Owns the worker tasks. Each worker repeatedly takes the highest-priority
/// queued job; a job is handed to exactly one worker.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    /// Stop taking new jobs.
    drain: CancellationToken,
    /// Cancel jobs still running after the grace period.
    abort: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn `workers` worker tasks.
    pub fn start(deps: WorkerDeps, workers: usize, idle_poll: Duration) -> Self {
        let drain = CancellationToken::new();
        let abort = CancellationToken::new();
        let registry = Arc::clone(&deps.registry);

        let handles = (0..workers.max(1))
            .map(|slot| {
                let worker = Worker::new(slot, deps.clone());
                let registry = Arc::clone(&registry);
                let drain = drain.clone();
                let abort = abort.clone();
                tokio::spawn(async move {
                    worker_loop(slot, worker, registry, idle_poll, drain, abort).await;
                })
            })
            .collect();

        info!(workers = workers.max(1), "Worker pool started");
        Self {
            registry,
            drain,
            abort,
            handles: Mutex::new(handles),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        !self.drain.is_cancelled()
    }

    /// Stop dispatching, give running jobs `grace` to finish, then cancel them.
    pub async fn shutdown(&self, grace: Duration) {
        self.drain.cancel();

        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let drained = tokio::time::timeout(grace, async {
            while let Some(handle) = handles.last_mut() {
                let _ = handle.await;
                handles.pop();
            }
        })
        .await;

        if drained.is_err() {
            warn!(grace_secs = grace.as_secs(), "Cancelling jobs still running after grace period");
            self.abort.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    slot: usize,
    worker: Worker,
    registry: Arc<JobRegistry>,
    idle_poll: Duration,
    drain: CancellationToken,
    abort: CancellationToken,
) {
    debug!(worker = slot, "Worker started");
    while !drain.is_cancelled() {
        match registry.dequeue_next().await {
            Some(dispatch) => worker.run(dispatch, &abort).await,
            None => {
                tokio::select! {
                    _ = drain.cancelled() => break,
                    _ = registry.wait_for_work(idle_poll) => {}
                }
            }
        }
    }
    debug!(worker = slot, "Worker stopped");
}
