//! Executes one dispatched job.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{Dispatch, JobOutcome, JobRegistry, PaymentState};
use crate::compute::{ComputeOutput, ProgressReporter, StrategyRegistry};
use crate::error::ComputeError;

/// Shared dependencies for workers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: Arc<JobRegistry>,
    pub strategies: Arc<StrategyRegistry>,
    /// Capacity of each job's progress channel.
    pub progress_buffer: usize,
    /// How long a finished computation waits for its payment verdict.
    pub payment_wait: Duration,
}

/// Runs dispatched jobs to a terminal status.
pub struct Worker {
    slot: usize,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(slot: usize, deps: WorkerDeps) -> Self {
        Self { slot, deps }
    }

    fn registry(&self) -> &Arc<JobRegistry> {
        &self.deps.registry
    }

    /// Execute a job. `abort` cancels the job when the pool is torn down.
    pub async fn run(&self, mut dispatch: Dispatch, abort: &CancellationToken) {
        let id = dispatch.id;
        info!(
            job_id = %id,
            worker = self.slot,
            tier = %dispatch.tier,
            algorithm = %dispatch.request.algorithm,
            work_size = dispatch.request.work_size,
            "Job started"
        );

        let outcome = match self.execute(&dispatch, abort).await {
            Ok(output) => self.await_payment(&mut dispatch, output).await,
            Err(e) if e.is_cancellation() => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e.to_string()),
        };

        if let Err(e) = self.registry().finish(id, outcome).await {
            error!(job_id = %id, error = %e, "Failed to record job outcome");
        }
    }

    /// Run the strategy on the blocking pool while forwarding progress.
    async fn execute(
        &self,
        dispatch: &Dispatch,
        abort: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError> {
        let strategy = self.deps.strategies.get(dispatch.request.algorithm)?;
        let (reporter, mut progress_rx) = ProgressReporter::channel(self.deps.progress_buffer);
        let request = dispatch.request;
        let cancel = dispatch.cancel.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || strategy.compute(&request, &reporter, &cancel));

        let limit = dispatch.max_runtime;
        let timer = tokio::time::sleep(limit.unwrap_or_default());
        tokio::pin!(timer);
        let mut timed_out = false;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                Some(progress) = progress_rx.recv() => {
                    self.registry().record_progress(dispatch.id, progress).await;
                }
                _ = &mut timer, if limit.is_some() && !timed_out => {
                    warn!(job_id = %dispatch.id, limit_secs = limit.unwrap_or_default().as_secs(), "Job exceeded max runtime");
                    timed_out = true;
                    dispatch.cancel.cancel();
                }
                _ = abort.cancelled(), if !dispatch.cancel.is_cancelled() => {
                    debug!(job_id = %dispatch.id, "Worker pool aborting job");
                    dispatch.cancel.cancel();
                }
            }
        };

        match joined {
            Ok(Err(ComputeError::Cancelled)) if timed_out => {
                Err(ComputeError::Timeout(limit.unwrap_or_default()))
            }
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id = %dispatch.id, panic = %message, "Strategy panicked");
                Err(ComputeError::Panicked(message))
            }
            Err(e) => Err(ComputeError::Fault(e.to_string())),
        }
    }

    /// Hold a finished result until the payment verdict arrives.
    async fn await_payment(&self, dispatch: &mut Dispatch, output: ComputeOutput) -> JobOutcome {
        let id = dispatch.id;
        let cancel = dispatch.cancel.clone();
        let payment = &mut dispatch.payment;
        if matches!(*payment.borrow(), PaymentState::Pending) {
            debug!(job_id = %id, "Computation done, awaiting payment verdict");
        }

        let wait = self.deps.payment_wait;
        let verdict = async move {
            tokio::time::timeout(
                wait,
                payment.wait_for(|s| !matches!(s, PaymentState::Pending)),
            )
            .await
            .map(|r| r.is_ok())
        };

        tokio::select! {
            biased;
            decided = verdict => {
                if decided.is_err() {
                    warn!(job_id = %id, "No payment verdict before deadline");
                }
                JobOutcome::Succeeded(output)
            }
            _ = cancel.cancelled() => JobOutcome::Cancelled,
        }
    }
}
