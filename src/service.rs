//! Caller-facing facade over the registry, worker pool and payment gate.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::ProviderBridge;
use crate::compute::{Algorithm, StrategyRegistry};
use crate::config::{BridgeConfig, ProviderConfig};
use crate::error::{Error, JobError, PaymentError, ValidationError};
use crate::jobs::{
    Job, JobEvent, JobFilter, JobId, JobRegistry, JobStatistics, NewJob, PaymentReference,
    QueueStatus, Scheduler, ShutdownReport, TaskSupervisor, WorkerDeps, spawn_cleanup_task,
};
use crate::ledger::Ledger;
use crate::payment::{FeeDistributor, PaymentGate, PaymentVerification};
use crate::pricing::{MethodInfo, PriceBreakdown, PricingEngine, PricingInfo, Tier};

/// The marketplace core, wired together.
pub struct ComputeService {
    registry: Arc<JobRegistry>,
    scheduler: Scheduler,
    supervisor: TaskSupervisor,
    ledger: Arc<dyn Ledger>,
    gate: Arc<PaymentGate>,
    fees: Arc<FeeDistributor>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ComputeService {
    /// Start the worker pool and cleanup sweep with the built-in strategies.
    pub fn start(config: &ProviderConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self::with_strategies(config, ledger, StrategyRegistry::with_builtins())
    }

    pub fn with_strategies(
        config: &ProviderConfig,
        ledger: Arc<dyn Ledger>,
        strategies: StrategyRegistry,
    ) -> Self {
        let pricing = Arc::new(PricingEngine::new(config.payment.community_address.clone()));
        let registry = Arc::new(JobRegistry::new(pricing, &config.market));
        let supervisor = TaskSupervisor::new();

        let deps = WorkerDeps {
            registry: Arc::clone(&registry),
            strategies: Arc::new(strategies),
            progress_buffer: config.market.progress_buffer,
            payment_wait: config.payment.verification_timeout,
        };
        let scheduler = Scheduler::start(
            deps,
            config.market.workers,
            config.market.idle_poll_interval,
        );
        let cleanup = spawn_cleanup_task(
            Arc::clone(&registry),
            config.market.cleanup_interval,
            config.market.retention,
            supervisor.shutdown_token(),
        );

        info!(
            workers = config.market.workers,
            max_jobs = config.market.max_jobs,
            service_address = %config.payment.service_address,
            "Compute service started"
        );
        Self {
            gate: Arc::new(PaymentGate::new(Arc::clone(&ledger), config.payment.clone())),
            fees: Arc::new(FeeDistributor::new(Arc::clone(&ledger), &config.payment)),
            registry,
            scheduler,
            supervisor,
            ledger,
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    /// A bridge feeding contract jobs into this service.
    pub fn bridge(&self, config: BridgeConfig) -> ProviderBridge {
        ProviderBridge::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.registry),
            Arc::clone(&self.gate),
            self.supervisor.clone(),
            config,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Admit a job paid by ledger transaction; the payment is verified in the
    /// background. Escrowed jobs only arrive through the contract bridge.
    pub async fn submit(&self, new: NewJob) -> Result<Job, Error> {
        if !self.scheduler.is_running() || self.supervisor.is_shutting_down() {
            return Err(JobError::ShuttingDown.into());
        }

        let job = self.registry.submit(new).await?;
        if let PaymentReference::Transaction(hash) = &job.payment_reference {
            self.spawn_verification(&job, hash.clone()).await;
        }
        Ok(job)
    }

    async fn spawn_verification(&self, job: &Job, tx_hash: String) {
        let id = job.id;
        let payer = job.client.clone();
        let expected = job.price.total_cost;
        let fee = job.price.fee_share;
        let registry = Arc::clone(&self.registry);
        let gate = Arc::clone(&self.gate);
        let fees = Arc::clone(&self.fees);
        let supervisor = self.supervisor.clone();

        let spawned = self.supervisor.spawn("payment_verification", Some(id), async move {
            match gate.redeem_payment(&tx_hash, &payer, expected).await {
                Ok(_) => {
                    if let Err(e) = registry.mark_payment_verified(id).await {
                        debug!(job_id = %id, error = %e, "Job gone before payment verdict");
                        return;
                    }
                    supervisor.spawn("fee_distribution", Some(id), async move {
                        if let Err(e) = fees.distribute(id, fee).await {
                            warn!(job_id = %id, error = %e, "Community fee not distributed");
                        }
                    });
                }
                Err(e) => {
                    if let Err(err) = registry.reject_payment(id, e).await {
                        debug!(job_id = %id, error = %err, "Job gone before payment verdict");
                    }
                }
            }
        });
        if !spawned {
            let _ = self
                .registry
                .reject_payment(id, PaymentError::NotVerified)
                .await;
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.registry.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.registry.list(filter).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        self.registry.cancel(id).await
    }

    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        self.registry.cleanup_completed(max_age).await
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.registry.queue_status().await
    }

    pub async fn statistics(&self) -> JobStatistics {
        self.registry.statistics().await
    }

    // ── Pricing ─────────────────────────────────────────────────────

    pub fn estimate(
        &self,
        work_size: u64,
        tier: Tier,
        algorithm: Option<Algorithm>,
    ) -> Result<PriceBreakdown, ValidationError> {
        self.registry.pricing().calculate_price(work_size, tier, algorithm)
    }

    pub fn compare_tiers(
        &self,
        work_size: u64,
        algorithm: Option<Algorithm>,
    ) -> Result<Vec<PriceBreakdown>, ValidationError> {
        self.registry.pricing().compare_tiers(work_size, algorithm)
    }

    pub fn suggest_tier(&self, work_size: u64) -> Result<Tier, ValidationError> {
        self.registry.pricing().suggest_tier(work_size)
    }

    pub fn pricing_info(&self) -> PricingInfo {
        self.registry.pricing().pricing_info()
    }

    pub fn method_info(&self, work_size: u64) -> Result<Vec<MethodInfo>, ValidationError> {
        self.registry.pricing().method_info(work_size)
    }

    // ── Payments ────────────────────────────────────────────────────

    /// Check a payment directly, without a job. Nothing is consumed.
    pub async fn verify_payment(
        &self,
        tx_hash: &str,
        payer: &str,
        expected: Decimal,
    ) -> Result<PaymentVerification, PaymentError> {
        self.gate.verify_payment(tx_hash, payer, expected).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Drain the worker pool, then the supervised tasks, each bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(grace_secs = grace.as_secs(), "Shutting down compute service");
        self.scheduler.shutdown(grace).await;
        let report = self.supervisor.shutdown(grace).await;
        if let Some(cleanup) = self.cleanup.lock().await.take() {
            let _ = cleanup.await;
        }
        info!(abandoned = report.abandoned, "Compute service stopped");
        report
    }
}
