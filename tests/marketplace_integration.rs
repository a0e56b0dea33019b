//! End-to-end tests for the marketplace core.
//!
//! Each test builds a `ComputeService` over an in-memory ledger and drives
//! jobs through admission, payment verification and the worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use compute_market::compute::{
    Algorithm, ComputeOutput, ComputeRequest, ComputeStrategy, ProgressReporter, StrategyRegistry,
};
use compute_market::config::{MarketConfig, PaymentConfig, ProviderConfig};
use compute_market::error::{ComputeError, Error, JobError, LedgerError, ValidationError};
use compute_market::jobs::{Job, JobEvent, JobFilter, JobId, JobStatus, JobType, NewJob, PaymentReference};
use compute_market::ledger::{
    BroadcastResult, Coin, ContractJob, EventFilter, EventStream, Ledger, LedgerCall, Transfer,
    TxRecord,
};
use compute_market::pricing::Tier;
use compute_market::service::ComputeService;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SERVICE: &str = "medas1service";
const CLIENT: &str = "medas1client";

/// In-memory ledger holding a fixed set of transactions.
#[derive(Default)]
struct StubLedger {
    txs: Mutex<HashMap<String, TxRecord>>,
    calls: Mutex<Vec<LedgerCall>>,
    next_tx: AtomicU64,
}

impl StubLedger {
    /// Record a fresh, generously funded transfer and return its hash.
    fn fund(&self) -> String {
        let hash = format!("TX{}", self.next_tx.fetch_add(1, Ordering::Relaxed));
        self.pay(&hash, 100_000_000);
        hash
    }

    fn pay(&self, hash: &str, amount: u128) {
        self.txs.lock().unwrap().insert(
            hash.to_string(),
            TxRecord {
                hash: hash.to_string(),
                code: 0,
                height: 1,
                transfers: vec![Transfer {
                    from: CLIENT.to_string(),
                    to: SERVICE.to_string(),
                    amount: vec![Coin::new("umedas", amount)],
                }],
                raw_log: String::new(),
            },
        );
    }
}

#[async_trait]
impl Ledger for StubLedger {
    async fn query_tx(&self, hash: &str) -> Result<TxRecord, LedgerError> {
        self.txs
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| LedgerError::TxNotFound(hash.to_string()))
    }

    async fn latest_height(&self) -> Result<u64, LedgerError> {
        Ok(10)
    }

    async fn execute(&self, call: LedgerCall) -> Result<BroadcastResult, LedgerError> {
        self.calls.lock().unwrap().push(call);
        Ok(BroadcastResult {
            tx_hash: "STUB".to_string(),
            code: 0,
            height: Some(10),
            raw_log: String::new(),
        })
    }

    async fn contract_job(&self, _contract: &str, job_id: u64) -> Result<ContractJob, LedgerError> {
        Err(LedgerError::InvalidResponse(format!("no contract job {job_id}")))
    }

    async fn subscribe(&self, _filter: &EventFilter) -> Result<EventStream, LedgerError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

/// Strategy that records execution order and holds until released.
struct RecordingStrategy {
    released: Arc<AtomicBool>,
    started: Arc<Mutex<Vec<u64>>>,
}

impl ComputeStrategy for RecordingStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Chudnovsky
    }

    fn compute(
        &self,
        request: &ComputeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError> {
        self.started.lock().unwrap().push(request.work_size);
        while !self.released.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        progress.report(50);
        Ok(ComputeOutput {
            value: "3.14".to_string(),
            digits: request.work_size,
            algorithm: request.algorithm,
            iterations: 1,
            elapsed_ms: 0,
            verified: false,
            computed_at: Utc::now(),
        })
    }
}

fn config(workers: usize, max_jobs: usize) -> ProviderConfig {
    ProviderConfig {
        market: MarketConfig {
            workers,
            max_jobs,
            idle_poll_interval: Duration::from_millis(20),
            ..MarketConfig::default()
        },
        payment: PaymentConfig {
            service_address: SERVICE.to_string(),
            community_address: "medas1community".to_string(),
            verification_timeout: Duration::from_secs(2),
            fee_retry_backoff: Duration::from_millis(1),
            ..PaymentConfig::default()
        },
        ..ProviderConfig::default()
    }
}

fn start(workers: usize, max_jobs: usize) -> (ComputeService, Arc<StubLedger>) {
    let ledger = Arc::new(StubLedger::default());
    let service = ComputeService::start(&config(workers, max_jobs), Arc::clone(&ledger) as Arc<dyn Ledger>);
    (service, ledger)
}

struct Recording {
    service: ComputeService,
    ledger: Arc<StubLedger>,
    released: Arc<AtomicBool>,
    started: Arc<Mutex<Vec<u64>>>,
}

/// Service whose default algorithm is replaced by a [`RecordingStrategy`].
fn start_recording(workers: usize) -> Recording {
    let released = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Mutex::new(Vec::new()));
    let mut strategies = StrategyRegistry::with_builtins();
    strategies.register(Arc::new(RecordingStrategy {
        released: Arc::clone(&released),
        started: Arc::clone(&started),
    }));
    let ledger = Arc::new(StubLedger::default());
    let service = ComputeService::with_strategies(
        &config(workers, 100),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        strategies,
    );
    Recording {
        service,
        ledger,
        released,
        started,
    }
}

/// A job paid by a fresh transfer on `ledger`.
fn paid(ledger: &StubLedger, tier: Tier, digits: u64) -> NewJob {
    job(tier, digits, PaymentReference::Transaction(ledger.fund()))
}

fn job(tier: Tier, digits: u64, payment: PaymentReference) -> NewJob {
    NewJob {
        job_type: JobType::PiCalculation,
        parameters: json!({"digits": digits}),
        client: CLIENT.to_string(),
        tier,
        payment,
    }
}

async fn wait_terminal(service: &ComputeService, id: JobId) -> Job {
    timeout(TEST_TIMEOUT, async {
        loop {
            let job = service.get(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn wait_started(started: &Mutex<Vec<u64>>, count: usize) {
    timeout(TEST_TIMEOUT, async {
        while started.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs did not start in time");
}

#[tokio::test]
async fn paid_basic_job_runs_to_completion() {
    let (service, ledger) = start(2, 10);
    ledger.pay("TX100", 10_000);
    let mut events = service.subscribe();

    let submitted = service
        .submit(job(Tier::Basic, 100, PaymentReference::Transaction("TX100".into())))
        .await
        .unwrap();
    assert_eq!(submitted.status, JobStatus::Queued);
    assert_eq!(submitted.price.total_cost, dec!(100) * dec!(0.0001));
    assert_eq!(submitted.price.algorithm, Algorithm::Chudnovsky);

    let done = wait_terminal(&service, submitted.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.payment_verified);
    let result = done.result.expect("completed job carries a result");
    assert!(result.value.starts_with("3.14159265358979"));
    assert_eq!(result.digits, 100);
    assert!(done.started_at.is_some() && done.completed_at.is_some());

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::StatusChanged { id, status } = event
            && id == submitted.id
        {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
    );

    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn premium_runs_before_earlier_basic_on_single_worker() {
    let Recording { service, ledger, released, started } = start_recording(1);

    // Occupy the only worker so the next two jobs queue up.
    let blocker = service
        .submit(paid(&ledger, Tier::Standard, 7))
        .await
        .unwrap();
    wait_started(&started, 1).await;

    let basic = service
        .submit(paid(&ledger, Tier::Basic, 11))
        .await
        .unwrap();
    let premium = service
        .submit(paid(&ledger, Tier::Premium, 13))
        .await
        .unwrap();
    released.store(true, Ordering::SeqCst);

    for id in [blocker.id, basic.id, premium.id] {
        assert_eq!(wait_terminal(&service, id).await.status, JobStatus::Completed);
    }
    assert_eq!(*started.lock().unwrap(), vec![7, 13, 11]);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn each_job_is_dispatched_once() {
    let Recording { service, ledger, released, started } = start_recording(4);
    released.store(true, Ordering::SeqCst);

    let mut ids = Vec::new();
    for n in 1..=20u64 {
        let tier = Tier::ALL[(n % 3) as usize];
        let job = service
            .submit(paid(&ledger, tier, n))
            .await
            .unwrap();
        ids.push(job.id);
    }
    for id in ids {
        assert_eq!(wait_terminal(&service, id).await.status, JobStatus::Completed);
    }

    let mut seen = started.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (1..=20).collect::<Vec<_>>());

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn oversize_request_creates_no_job() {
    let (service, ledger) = start(1, 10);

    let err = service
        .submit(paid(&ledger, Tier::Basic, 1_001))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::WorkSizeExceedsTier { work_size: 1_001, max: 1_000, .. })
    ));
    assert!(service.list(&JobFilter::default()).await.is_empty());
    assert_eq!(service.statistics().await.total, 0);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn capacity_limit_rejects_extra_jobs() {
    let Recording { service, ledger, released, .. } = start_recording(1);
    for n in 0..100 {
        service
            .submit(paid(&ledger, Tier::Basic, 5))
            .await
            .unwrap();
    }
    let err = service
        .submit(paid(&ledger, Tier::Basic, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Capacity(c) if c.max == 100));

    released.store(true, Ordering::SeqCst);
    service.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn cancelling_a_finished_job_is_an_error() {
    let (service, ledger) = start(1, 10);
    let submitted = service
        .submit(paid(&ledger, Tier::Basic, 20))
        .await
        .unwrap();
    let done = wait_terminal(&service, submitted.id).await;
    assert_eq!(done.status, JobStatus::Completed);

    let err = service.cancel(submitted.id).await.unwrap_err();
    assert_eq!(
        err,
        JobError::NotCancellable {
            id: submitted.id,
            status: JobStatus::Completed
        }
    );
    assert_eq!(service.get(submitted.id).await.unwrap(), done);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancelling_a_running_job() {
    let Recording { service, ledger, started, .. } = start_recording(1);
    let submitted = service
        .submit(paid(&ledger, Tier::Basic, 9))
        .await
        .unwrap();
    wait_started(&started, 1).await;

    service.cancel(submitted.id).await.unwrap();
    let done = wait_terminal(&service, submitted.id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(done.result.is_none());

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unverifiable_payment_fails_the_job() {
    let (service, ledger) = start(1, 10);

    let submitted = service
        .submit(job(Tier::Basic, 50, PaymentReference::Transaction("UNKNOWN".into())))
        .await
        .unwrap();
    let done = wait_terminal(&service, submitted.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert!(!done.payment_verified);
    assert!(done.result.is_none());
    assert!(done.error.unwrap().contains("UNKNOWN"));

    service.shutdown(Duration::from_secs(1)).await;
    assert!(ledger.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_respects_age_threshold() {
    let (service, ledger) = start(2, 10);
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            service
                .submit(paid(&ledger, Tier::Basic, 10))
                .await
                .unwrap()
                .id,
        );
    }
    for id in &ids {
        wait_terminal(&service, *id).await;
    }

    assert_eq!(service.cleanup_completed(Duration::MAX).await, 0);
    assert_eq!(service.list(&JobFilter::default()).await.len(), 3);

    assert_eq!(service.cleanup_completed(Duration::ZERO).await, 3);
    assert!(service.list(&JobFilter::default()).await.is_empty());
    assert!(matches!(
        service.get(ids[0]).await,
        Err(JobError::NotFound { .. })
    ));

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn queue_status_reflects_waiting_jobs() {
    let Recording { service, ledger, released, started } = start_recording(1);
    service
        .submit(paid(&ledger, Tier::Basic, 3))
        .await
        .unwrap();
    wait_started(&started, 1).await;
    service
        .submit(paid(&ledger, Tier::Premium, 4))
        .await
        .unwrap();
    service
        .submit(paid(&ledger, Tier::Premium, 5))
        .await
        .unwrap();

    let status = service.queue_status().await;
    assert_eq!(status.total_queued, 2);
    assert_eq!(status.max_workers, 1);
    let premium = status.tiers.iter().find(|d| d.tier == Tier::Premium).unwrap();
    assert_eq!(premium.queued, 2);

    let stats = service.statistics().await;
    assert_eq!(stats.running, 1);
    assert_eq!(stats.queued, 2);

    released.store(true, Ordering::SeqCst);
    service.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn escrow_cannot_be_claimed_through_the_service() {
    let (service, ledger) = start(1, 10);

    let err = service
        .submit(job(Tier::Premium, 50_000, PaymentReference::Escrow(123_456)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::EscrowNotAccepted)));
    assert!(service.list(&JobFilter::default()).await.is_empty());

    service.shutdown(Duration::from_secs(1)).await;
    assert!(ledger.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reused_transaction_pays_for_a_single_job() {
    let (service, ledger) = start(2, 10);
    ledger.pay("TX1", 10_000);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let submitted = service
            .submit(job(Tier::Basic, 100, PaymentReference::Transaction("TX1".into())))
            .await
            .unwrap();
        ids.push(submitted.id);
    }

    let mut completed = 0;
    for id in ids {
        let done = wait_terminal(&service, id).await;
        if done.status == JobStatus::Completed {
            completed += 1;
        } else {
            assert_eq!(done.status, JobStatus::Failed);
            assert!(done.result.is_none());
            assert!(done.error.unwrap().contains("already been used"));
        }
    }
    assert_eq!(completed, 1);

    service.shutdown(Duration::from_secs(2)).await;
}
