//! Supervisor for background work attached to jobs.
//!
//! Payment verification, fee distribution and bridge handlers run as
//! supervised tasks instead of detached spawns. Outstanding work is counted
//! per job so shutdown can wait for it, or abandon it, deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::model::JobId;

#[derive(Debug, Default)]
struct Outstanding {
    per_job: HashMap<JobId, usize>,
    unattached: usize,
    handles: Vec<AbortHandle>,
}

/// Decrements the outstanding count when the task ends, however it ends.
struct TaskGuard {
    state: Arc<Mutex<Outstanding>>,
    job: Option<JobId>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        match self.job {
            Some(job) => {
                if let Some(count) = state.per_job.get_mut(&job) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.per_job.remove(&job);
                    }
                }
            }
            None => state.unattached = state.unattached.saturating_sub(1),
        }
    }
}

fn lock(state: &Mutex<Outstanding>) -> MutexGuard<'_, Outstanding> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of [`TaskSupervisor::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks still running when the grace period ended and were aborted.
    pub abandoned: usize,
}

/// Tracks supervised background tasks.
#[derive(Clone)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    state: Arc<Mutex<Outstanding>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            state: Arc::new(Mutex::new(Outstanding::default())),
        }
    }

    /// Token cancelled when shutdown begins. Long-running tasks select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn a supervised task, optionally attached to a job.
    ///
    /// Returns `false` without spawning once shutdown has begun.
    pub fn spawn<F>(&self, kind: &'static str, job: Option<JobId>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            warn!(kind, job_id = ?job, "Supervisor shutting down, task not started");
            return false;
        }

        {
            let mut state = lock(&self.state);
            match job {
                Some(id) => *state.per_job.entry(id).or_insert(0) += 1,
                None => state.unattached += 1,
            }
        }

        let guard = TaskGuard {
            state: Arc::clone(&self.state),
            job,
        };
        let handle = self.tracker.spawn(async move {
            let _guard = guard;
            task.await;
        });

        let mut state = lock(&self.state);
        state.handles.retain(|h| !h.is_finished());
        state.handles.push(handle.abort_handle());
        drop(state);

        debug!(kind, job_id = ?job, "Supervised task started");
        true
    }

    /// Outstanding tasks attached to `job`.
    pub fn outstanding(&self, job: JobId) -> usize {
        lock(&self.state).per_job.get(&job).copied().unwrap_or(0)
    }

    /// All outstanding tasks.
    pub fn total_outstanding(&self) -> usize {
        let state = lock(&self.state);
        state.per_job.values().sum::<usize>() + state.unattached
    }

    /// Stop accepting tasks, wait up to `grace` for the rest, then abort them.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shutdown.cancel();
        self.tracker.close();

        let pending = self.total_outstanding();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "Waiting for supervised tasks");
        }

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return ShutdownReport { abandoned: 0 };
        }

        let handles = std::mem::take(&mut lock(&self.state).handles);
        let abandoned = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        self.tracker.wait().await;
        warn!(abandoned, "Abandoned supervised tasks after grace period");
        ShutdownReport { abandoned }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
