//! Error types for the compute marketplace.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::jobs::{JobId, JobStatus};

/// Top-level error type for the marketplace core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Computation error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Request rejected at submission time. No job is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported job type: {0}")]
    UnknownJobType(String),

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Unknown algorithm: {0} (use: chudnovsky, machin, bailey)")]
    UnknownAlgorithm(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Work size must be positive")]
    NonPositiveWorkSize,

    #[error("Work size ({work_size}) exceeds {tier} tier limit ({max})")]
    WorkSizeExceedsTier {
        work_size: u64,
        tier: String,
        max: u64,
    },

    #[error("No tier can handle a work size of {0}")]
    NoTierFits(u64),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Escrow payments are only accepted from the marketplace contract")]
    EscrowNotAccepted,
}

/// Global concurrent-job limit reached. No job is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Maximum concurrent jobs ({max}) reached")]
pub struct CapacityError {
    pub max: usize,
}

/// Job lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Job {id} is {status} and cannot be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },

    #[error("Job {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} did not finish within {after:?}")]
    DeadlineExceeded { id: JobId, after: Duration },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Payment verification failures. Post-admission these force the job to Failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("Transaction {tx_hash} failed on chain (code {code}): {log}")]
    TransactionFailed {
        tx_hash: String,
        code: u32,
        log: String,
    },

    #[error("No transfer from {payer} to {recipient} found in transaction {tx_hash}")]
    TransferNotFound {
        tx_hash: String,
        payer: String,
        recipient: String,
    },

    #[error("Insufficient payment: received {received} {denom}, expected at least {required} {denom}")]
    InsufficientAmount {
        received: u128,
        required: u128,
        denom: String,
    },

    #[error("Insufficient confirmations: {confirmations} (required: {required})")]
    InsufficientConfirmations { confirmations: u64, required: u64 },

    #[error("Payment verification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid expected amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Ledger lookup failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Payment was not verified before completion")]
    NotVerified,

    #[error("Payment {0} has already been used")]
    AlreadyUsed(String),

    #[error("Escrow for contract job {job_id} rejected: {reason}")]
    EscrowRejected { job_id: u64, reason: String },
}

/// Failures while executing a computation. Recovered at the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("Invalid work size {work_size}: {reason}")]
    InvalidSize { work_size: u64, reason: String },

    #[error("No strategy registered for algorithm {0}")]
    UnknownAlgorithm(String),

    #[error("Computation fault: {0}")]
    Fault(String),

    #[error("Computation panicked: {0}")]
    Panicked(String),

    #[error("Job exceeded its maximum runtime of {0:?}")]
    Timeout(Duration),

    #[error("Computation cancelled")]
    Cancelled,
}

impl ComputeError {
    /// Whether this error ends the job as Cancelled rather than Failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Ledger collaborator failures. Surfaced to the caller of the operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Transaction {0} not found")]
    TxNotFound(String),

    #[error("Ledger request failed: {0}")]
    Request(String),

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),

    #[error("Broadcast rejected (code {code}): {log}")]
    BroadcastRejected { code: u32, log: String },

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Ledger request timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Result type alias for the marketplace.
pub type Result<T> = std::result::Result<T, Error>;
