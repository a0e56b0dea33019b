//! Job registry: the job map, the tier queues, and every status change.
//!
//! The job map and the queue set sit behind separate locks so listing does not
//! contend with enqueue/dequeue. When both are needed the job map is locked
//! first. Once a job is dispatched its status, progress and result are only
//! written by the worker that owns it, except for the forced failure applied
//! when payment is rejected, which still goes through the state machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Job, JobId, JobParameters, JobStatus, JobType, PaymentReference};
use super::queue::{QueueSet, TierDepth};
use crate::compute::{ComputeOutput, ComputeRequest};
use crate::config::MarketConfig;
use crate::error::{CapacityError, Error, JobError, PaymentError, ValidationError};
use crate::pricing::{PriceBreakdown, PricingEngine, Tier};

/// Capacity of the job event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Payment verdict for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Verified,
    Rejected(PaymentError),
}

/// A submission request. Parameters are decoded against `job_type` once.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub parameters: serde_json::Value,
    pub client: String,
    pub tier: Tier,
    pub payment: PaymentReference,
}

/// Filter for [`JobRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub client: Option<String>,
    pub status: Option<JobStatus>,
}

/// Lifecycle notification broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged { id: JobId, status: JobStatus },
    Progress { id: JobId, progress: u8 },
}

/// Everything a worker needs to run a dequeued job.
pub struct Dispatch {
    pub id: JobId,
    pub tier: Tier,
    pub request: ComputeRequest,
    /// Hard runtime limit, when enforced.
    pub max_runtime: Option<Duration>,
    pub cancel: CancellationToken,
    pub payment: watch::Receiver<PaymentState>,
}

/// How a worker finished a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(ComputeOutput),
    Failed(String),
    Cancelled,
}

/// Queue depths and worker occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub tiers: Vec<TierDepth>,
    pub total_queued: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub active_jobs: usize,
    pub max_jobs: usize,
}

/// Job counts by status and tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatistics {
    pub total: usize,
    pub submitted: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub payment_verified: usize,
    pub by_tier: BTreeMap<Tier, usize>,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    payment: watch::Sender<PaymentState>,
}

/// In-memory registry of jobs and their queues.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    queues: Mutex<QueueSet>,
    next_id: AtomicU64,
    pricing: Arc<PricingEngine>,
    max_jobs: usize,
    workers: usize,
    enforce_max_runtime: bool,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    pub fn new(pricing: Arc<PricingEngine>, config: &MarketConfig) -> Self {
        let queues = QueueSet::new(pricing.tiers().iter().map(|t| (t.name, t.priority_rank)));
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            queues: Mutex::new(queues),
            next_id: AtomicU64::new(1),
            pricing,
            max_jobs: config.max_jobs,
            workers: config.workers,
            enforce_max_runtime: config.enforce_max_runtime,
            notify: Notify::new(),
            events,
        }
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    /// Subscribe to status and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Decode parameters and price a request without admitting it.
    pub fn quote(
        &self,
        job_type: JobType,
        parameters: &serde_json::Value,
        tier: Tier,
    ) -> Result<(JobParameters, PriceBreakdown), Error> {
        let parameters = JobParameters::decode(job_type, parameters)?;
        let price = self.pricing.calculate_price(
            parameters.work_size(),
            tier,
            Some(parameters.algorithm()),
        )?;
        Ok((parameters, price))
    }

    /// Validate, price and enqueue a job paid by ledger transaction.
    ///
    /// The job starts unverified. Errors are returned synchronously and leave
    /// no job behind.
    pub async fn submit(&self, new: NewJob) -> Result<Job, Error> {
        if new.payment.is_escrow() {
            return Err(ValidationError::EscrowNotAccepted.into());
        }
        self.admit(new, false).await
    }

    /// Admit a contract job whose escrow has already been checked.
    pub(crate) async fn submit_escrowed(&self, new: NewJob) -> Result<Job, Error> {
        if !new.payment.is_escrow() {
            return Err(ValidationError::MissingField("escrow").into());
        }
        self.admit(new, true).await
    }

    async fn admit(&self, new: NewJob, prepaid: bool) -> Result<Job, Error> {
        if new.client.trim().is_empty() {
            return Err(ValidationError::MissingField("client").into());
        }
        if let PaymentReference::Transaction(hash) = &new.payment
            && hash.trim().is_empty()
        {
            return Err(ValidationError::MissingField("payment_reference").into());
        }

        let mut jobs = self.jobs.write().await;
        let active = jobs.values().filter(|e| e.job.status.is_active()).count();
        if active >= self.max_jobs {
            warn!(active, max = self.max_jobs, "Rejected job: at capacity");
            return Err(CapacityError { max: self.max_jobs }.into());
        }

        let (parameters, price) = self.quote(new.job_type, &new.parameters, new.tier)?;
        let priority = self.pricing.tier(new.tier)?.priority_rank;

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut job = Job {
            id,
            job_type: new.job_type,
            parameters,
            status: JobStatus::Submitted,
            tier: new.tier,
            priority,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0,
            result: None,
            error: None,
            payment_reference: new.payment,
            payment_verified: prepaid,
            price,
            client: new.client,
        };
        // Submitted and Queued are set together.
        let _ = job.transition_to(JobStatus::Queued);

        let initial = if prepaid {
            PaymentState::Verified
        } else {
            PaymentState::Pending
        };
        let (payment, _rx) = watch::channel(initial);
        let snapshot = job.clone();
        jobs.insert(
            id,
            JobEntry {
                job,
                cancel: CancellationToken::new(),
                payment,
            },
        );
        self.queues.lock().await.push(snapshot.tier, priority, id);
        drop(jobs);

        info!(
            job_id = %id,
            tier = %snapshot.tier,
            work_size = snapshot.parameters.work_size(),
            algorithm = %snapshot.parameters.algorithm(),
            total_cost = %snapshot.price.total_cost,
            client = %snapshot.client,
            "Job queued"
        );
        self.emit(JobEvent::StatusChanged {
            id,
            status: JobStatus::Queued,
        });
        self.notify.notify_one();
        Ok(snapshot)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|e| e.job.clone())
            .ok_or(JobError::NotFound { id })
    }

    /// Copies of matching jobs, ordered by ID.
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|e| &e.job)
            .filter(|j| filter.client.as_deref().is_none_or(|c| j.client == c))
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let (running, active) = {
            let jobs = self.jobs.read().await;
            let running = jobs
                .values()
                .filter(|e| e.job.status == JobStatus::Running)
                .count();
            let active = jobs.values().filter(|e| e.job.status.is_active()).count();
            (running, active)
        };
        let queues = self.queues.lock().await;
        QueueStatus {
            tiers: queues.depths(),
            total_queued: queues.len(),
            active_workers: running,
            max_workers: self.workers,
            active_jobs: active,
            max_jobs: self.max_jobs,
        }
    }

    pub async fn statistics(&self) -> JobStatistics {
        let jobs = self.jobs.read().await;

        let mut stats = JobStatistics::default();
        for entry in jobs.values() {
            let job = &entry.job;
            match job.status {
                JobStatus::Submitted => stats.submitted += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            if job.payment_verified {
                stats.payment_verified += 1;
            }
            *stats.by_tier.entry(job.tier).or_insert(0) += 1;
        }

        stats.total = jobs.len();
        stats
    }

    // ── Cancellation & cleanup ──────────────────────────────────────

    /// Cancel a non-terminal job.
    ///
    /// Queued jobs become Cancelled immediately. Running jobs have their token
    /// triggered and are marked Cancelled by their worker.
    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        let status = entry.job.status;
        if !status.is_cancellable() {
            return Err(JobError::NotCancellable { id, status });
        }

        entry.cancel.cancel();
        if status != JobStatus::Running {
            self.queues.lock().await.remove(id);
            let _ = entry.job.transition_to(JobStatus::Cancelled);
            self.emit(JobEvent::StatusChanged {
                id,
                status: JobStatus::Cancelled,
            });
        }
        info!(job_id = %id, was = %status, "Job cancellation requested");
        Ok(entry.job.clone())
    }

    /// Purge terminal jobs completed more than `max_age` ago. Returns the count.
    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| {
            !(e.job.status.is_terminal() && e.job.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - jobs.len();

        if removed > 0 {
            info!(count = removed, "Cleaned up completed jobs");
        }
        removed
    }

    // ── Worker side ─────────────────────────────────────────────────

    /// Wait until a job may have been enqueued, or `timeout` elapses.
    pub(crate) async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Take the highest-priority queued job and mark it Running.
    pub(crate) async fn dequeue_next(&self) -> Option<Dispatch> {
        loop {
            let mut jobs = self.jobs.write().await;
            let (_, id) = self.queues.lock().await.pop_next()?;

            let Some(entry) = jobs.get_mut(&id) else {
                continue;
            };
            if entry.job.status != JobStatus::Queued {
                debug!(job_id = %id, status = %entry.job.status, "Skipping stale queue entry");
                continue;
            }
            let _ = entry.job.transition_to(JobStatus::Running);

            let max_runtime = if self.enforce_max_runtime {
                self.pricing.tier(entry.job.tier).ok().map(|t| t.max_runtime)
            } else {
                None
            };
            let dispatch = Dispatch {
                id,
                tier: entry.job.tier,
                request: entry.job.parameters.compute_request(),
                max_runtime,
                cancel: entry.cancel.clone(),
                payment: entry.payment.subscribe(),
            };
            drop(jobs);

            self.emit(JobEvent::StatusChanged {
                id,
                status: JobStatus::Running,
            });
            return Some(dispatch);
        }
    }

    /// Record progress for a running job. Values never decrease.
    pub(crate) async fn record_progress(&self, id: JobId, progress: u8) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };
        // 100 is reserved for Completed.
        let progress = progress.min(99);
        if entry.job.status != JobStatus::Running || progress <= entry.job.progress {
            return;
        }
        entry.job.progress = progress;
        drop(jobs);

        debug!(job_id = %id, progress, "Job progress");
        self.emit(JobEvent::Progress { id, progress });
    }

    /// Finish a running job.
    ///
    /// Success only becomes Completed when payment is verified; otherwise the
    /// job fails with the payment error and the result is discarded. A
    /// cancellation triggered by a payment rejection is also reported as
    /// Failed.
    pub(crate) async fn finish(&self, id: JobId, outcome: JobOutcome) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        let rejection = match &*entry.payment.borrow() {
            PaymentState::Rejected(e) => Some(e.clone()),
            _ => None,
        };

        let (status, error, result) = match outcome {
            JobOutcome::Succeeded(output) if entry.job.payment_verified => {
                (JobStatus::Completed, None, Some(output))
            }
            JobOutcome::Succeeded(_) => {
                let err = rejection.unwrap_or(PaymentError::NotVerified);
                (JobStatus::Failed, Some(err.to_string()), None)
            }
            JobOutcome::Cancelled => match rejection {
                Some(err) => (JobStatus::Failed, Some(err.to_string()), None),
                None => (JobStatus::Cancelled, None, None),
            },
            JobOutcome::Failed(message) => (JobStatus::Failed, Some(message), None),
        };

        let from = entry.job.status;
        entry
            .job
            .transition_to(status)
            .map_err(|from| JobError::InvalidTransition {
                id,
                from,
                to: status,
            })?;
        if status == JobStatus::Completed {
            entry.job.progress = 100;
        }
        entry.job.error = error;
        entry.job.result = result;
        let snapshot = entry.job.clone();
        drop(jobs);

        match status {
            JobStatus::Completed => info!(
                job_id = %id,
                elapsed_ms = snapshot.elapsed().map(|d| d.num_milliseconds()).unwrap_or(0),
                "Job completed"
            ),
            JobStatus::Cancelled => info!(job_id = %id, "Job cancelled"),
            _ => warn!(
                job_id = %id,
                from = %from,
                error = snapshot.error.as_deref().unwrap_or(""),
                "Job failed"
            ),
        }
        self.emit(JobEvent::StatusChanged { id, status });
        Ok(snapshot)
    }

    // ── Payment verdicts ────────────────────────────────────────────

    /// Mark a job's payment as verified. Returns the job's current status.
    pub async fn mark_payment_verified(&self, id: JobId) -> Result<JobStatus, JobError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        entry.job.payment_verified = true;
        entry.payment.send_replace(PaymentState::Verified);
        info!(job_id = %id, status = %entry.job.status, "Payment verified");
        Ok(entry.job.status)
    }

    /// Record a failed verification.
    ///
    /// Jobs that have not started fail immediately. A running job has its
    /// token cancelled; its worker then reports it as Failed. Terminal jobs
    /// are left as they are.
    pub async fn reject_payment(&self, id: JobId, error: PaymentError) -> Result<JobStatus, JobError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        let status = entry.job.status;
        if status.is_terminal() {
            debug!(job_id = %id, %status, "Ignoring payment rejection for finished job");
            return Ok(status);
        }

        warn!(job_id = %id, %status, error = %error, "Payment rejected");
        entry.job.payment_verified = false;
        entry.payment.send_replace(PaymentState::Rejected(error.clone()));
        entry.cancel.cancel();

        if status == JobStatus::Running {
            return Ok(status);
        }
        self.queues.lock().await.remove(id);
        let _ = entry.job.transition_to(JobStatus::Failed);
        entry.job.error = Some(error.to_string());
        self.emit(JobEvent::StatusChanged {
            id,
            status: JobStatus::Failed,
        });
        Ok(JobStatus::Failed)
    }
}

/// Spawn a background task that periodically purges old terminal jobs.
pub fn spawn_cleanup_task(
    registry: Arc<JobRegistry>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.cleanup_completed(retention).await;
                }
            }
        }
        debug!("Cleanup task stopped");
    })
}
