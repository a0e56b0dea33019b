//! Provider event bridge.
//!
//! Listens for `submit_job` events addressed to this provider, runs each job
//! through the local registry and reports the outcome back to the marketplace
//! contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compute::ComputeOutput;
use crate::config::BridgeConfig;
use crate::error::{Error, JobError, LedgerError, PaymentError, ValidationError};
use crate::jobs::{Job, JobId, JobRegistry, JobStatus, JobType, NewJob, PaymentReference, TaskSupervisor};
use crate::ledger::{
    BroadcastResult, Capability, ContractMsg, EventFilter, Ledger, LedgerCall, PriceInfo,
};
use crate::payment::PaymentGate;

/// First reconnect delay; doubles up to `max_reconnect_backoff`.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Advertised average completion time, in seconds.
const AVG_COMPLETION_SECS: u64 = 180;

/// Hex SHA-256 of a result's JSON encoding.
pub fn result_hash(output: &ComputeOutput) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(output)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Connects the marketplace contract to the local job registry.
#[derive(Clone)]
pub struct ProviderBridge {
    ledger: Arc<dyn Ledger>,
    registry: Arc<JobRegistry>,
    gate: Arc<PaymentGate>,
    supervisor: TaskSupervisor,
    config: BridgeConfig,
}

impl ProviderBridge {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<JobRegistry>,
        gate: Arc<PaymentGate>,
        supervisor: TaskSupervisor,
        config: BridgeConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            gate,
            supervisor,
            config,
        }
    }

    fn contract_call(&self, msg: ContractMsg) -> LedgerCall {
        LedgerCall::Contract {
            contract: self.config.contract_address.clone(),
            msg,
        }
    }

    pub fn result_url(&self, contract_job: u64) -> String {
        format!(
            "{}/results/{}.json",
            self.config.endpoint_url.trim_end_matches('/'),
            contract_job
        )
    }

    /// Announce this provider and its prices to the contract.
    pub async fn register(&self) -> Result<BroadcastResult, LedgerError> {
        let pricing = self.registry.pricing();
        let max_complexity = pricing
            .tiers()
            .iter()
            .map(|t| t.max_work_size)
            .max()
            .unwrap_or_default();
        let base_price = pricing
            .tier(self.config.tier)
            .map(|t| t.price_per_unit.normalize().to_string())
            .unwrap_or_default();

        let service_type = JobType::PiCalculation.to_string();
        let msg = ContractMsg::RegisterProvider {
            name: self.config.provider_name.clone(),
            capabilities: vec![Capability {
                service_type: service_type.clone(),
                max_complexity,
                avg_completion_time: AVG_COMPLETION_SECS,
            }],
            pricing: BTreeMap::from([(
                service_type,
                PriceInfo {
                    base_price,
                    unit: "digit".to_string(),
                },
            )]),
            endpoint: self.config.endpoint_url.clone(),
        };

        let result = self.ledger.execute(self.contract_call(msg)).await?;
        info!(
            provider = %self.config.provider_address,
            name = %self.config.provider_name,
            tx_hash = %result.tx_hash,
            "Provider registered"
        );
        Ok(result)
    }

    /// Run the heartbeat and event loops until shutdown.
    pub async fn run(self) {
        let shutdown = self.supervisor.shutdown_token();
        if let Some(interval) = self.config.heartbeat_interval {
            let bridge = self.clone();
            let token = shutdown.clone();
            self.supervisor.spawn("heartbeat", None, async move {
                bridge.heartbeat_loop(interval, token).await;
            });
        }
        self.event_loop(&shutdown).await;
    }

    async fn heartbeat_loop(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.ledger.execute(self.contract_call(ContractMsg::HeartBeat {})).await {
                        Ok(result) => debug!(tx_hash = %result.tx_hash, "Heartbeat sent"),
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }

    /// Subscribe, dispatch events, and reconnect with backoff when the feed
    /// drops. Gives up after `max_reconnect_attempts` consecutive failures.
    async fn event_loop(&self, shutdown: &CancellationToken) {
        let filter = EventFilter::submitted_jobs(
            &self.config.contract_address,
            &self.config.provider_address,
        );
        let mut failures = 0u32;
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            match self.ledger.subscribe(&filter).await {
                Ok(mut events) => {
                    info!(contract = %self.config.contract_address, "Listening for job events");
                    failures = 0;
                    delay = INITIAL_RECONNECT_DELAY;
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            event = events.recv() => match event {
                                Some(event) => self.dispatch(event.job_id),
                                None => break,
                            }
                        }
                    }
                    warn!("Job event subscription dropped");
                }
                Err(e) => warn!(error = %e, attempt = failures + 1, "Job event subscription failed"),
            }

            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                error!(
                    attempts = failures,
                    "Giving up on job event subscription"
                );
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_reconnect_backoff);
        }
    }

    fn dispatch(&self, contract_job: u64) {
        debug!(contract_job, "Job event received");
        let bridge = self.clone();
        let spawned = self.supervisor.spawn("bridge_job", None, async move {
            bridge.handle_job(contract_job).await;
        });
        if !spawned {
            warn!(contract_job, "Dropping job event during shutdown");
        }
    }

    /// Execute one contract job end to end and report the outcome.
    pub async fn handle_job(&self, contract_job: u64) {
        match self.run_job(contract_job).await {
            Ok(job) if job.status == JobStatus::Completed => {
                if let Err(e) = self.report_completion(contract_job, &job).await {
                    error!(contract_job, job_id = %job.id, error = %e, "Failed to report completion");
                }
            }
            Ok(job) => {
                // The contract's own timeout handles refunds for failed work.
                warn!(
                    contract_job,
                    job_id = %job.id,
                    status = %job.status,
                    error = job.error.as_deref().unwrap_or(""),
                    "Job did not complete"
                );
            }
            Err(Error::Payment(PaymentError::AlreadyUsed(_))) => {
                // Replayed event for a job already taken.
                debug!(contract_job, "Duplicate job event ignored");
            }
            Err(e) => {
                warn!(contract_job, error = %e, "Job could not be processed");
                self.report_failure(contract_job, &e.to_string()).await;
            }
        }
    }

    async fn run_job(&self, contract_job: u64) -> Result<Job, Error> {
        let remote = self
            .ledger
            .contract_job(&self.config.contract_address, contract_job)
            .await?;
        let job_type: JobType = remote.job_type.parse()?;
        let parameters: serde_json::Value = serde_json::from_str(&remote.parameters)
            .map_err(|e| ValidationError::InvalidParameters(e.to_string()))?;

        let (_, price) = self.registry.quote(job_type, &parameters, self.config.tier)?;
        self.gate
            .redeem_escrow(&remote, &self.config.provider_address, price.total_cost)?;

        let payment = PaymentReference::Escrow(contract_job);
        let submitted = self
            .registry
            .submit_escrowed(NewJob {
                job_type,
                parameters,
                client: remote.client,
                tier: self.config.tier,
                payment: payment.clone(),
            })
            .await;
        let job = match submitted {
            Ok(job) => job,
            Err(e) => {
                self.gate.release(&payment);
                return Err(e);
            }
        };
        info!(contract_job, job_id = %job.id, "Contract job accepted");

        self.await_terminal(job.id).await
    }

    async fn await_terminal(&self, id: JobId) -> Result<Job, Error> {
        let timeout = self.config.job_timeout;
        let poll = async {
            loop {
                let job = self.registry.get(id).await?;
                if job.status.is_terminal() {
                    return Ok::<_, Error>(job);
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = self.registry.cancel(id).await {
                    debug!(job_id = %id, error = %e, "Cancel after deadline");
                }
                Err(JobError::DeadlineExceeded { id, after: timeout }.into())
            }
        }
    }

    async fn report_completion(&self, contract_job: u64, job: &Job) -> Result<(), Error> {
        let output = job
            .result
            .as_ref()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("job {} has no result", job.id)))?;
        let hash = result_hash(output).map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        let msg = ContractMsg::CompleteJob {
            job_id: contract_job,
            result_hash: hash,
            result_url: self.result_url(contract_job),
        };
        let result = self.ledger.execute(self.contract_call(msg)).await?;
        info!(contract_job, job_id = %job.id, tx_hash = %result.tx_hash, "Completion reported");
        Ok(())
    }

    async fn report_failure(&self, contract_job: u64, reason: &str) {
        let msg = ContractMsg::FailJob {
            job_id: contract_job,
            reason: reason.to_string(),
        };
        match self.ledger.execute(self.contract_call(msg)).await {
            Ok(result) => info!(contract_job, tx_hash = %result.tx_hash, "Failure reported"),
            Err(e) => error!(contract_job, error = %e, "Failed to report failure"),
        }
    }
}
