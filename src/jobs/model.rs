//! Job records and the job state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compute::{Algorithm, ComputeOutput, ComputeRequest};
use crate::error::ValidationError;
use crate::pricing::{PriceBreakdown, Tier};

/// Unique, monotonically increasing job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of computation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PiCalculation,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PiCalculation => write!(f, "pi_calculation"),
        }
    }
}

impl FromStr for JobType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pi_calculation" | "pi" => Ok(Self::PiCalculation),
            other => Err(ValidationError::UnknownJobType(other.to_string())),
        }
    }
}

/// Parameters for a π calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationParams {
    /// Decimal places to compute.
    pub digits: u64,
    #[serde(default)]
    pub method: Algorithm,
}

/// Type-specific job parameters, decoded once at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParameters {
    PiCalculation(CalculationParams),
}

impl JobParameters {
    /// Decode loosely-typed caller parameters for `job_type`.
    ///
    /// Accepts `digits` (alias `work_size`) as a number or numeric string, and
    /// an optional `method` (alias `algorithm`) defaulting to Chudnovsky.
    pub fn decode(job_type: JobType, raw: &serde_json::Value) -> Result<Self, ValidationError> {
        match job_type {
            JobType::PiCalculation => {
                let obj = raw.as_object().ok_or_else(|| {
                    ValidationError::InvalidParameters("parameters must be an object".to_string())
                })?;

                let digits = obj
                    .get("digits")
                    .or_else(|| obj.get("work_size"))
                    .ok_or(ValidationError::MissingField("digits"))?;
                let digits = parse_work_size(digits)?;

                let method = match obj.get("method").or_else(|| obj.get("algorithm")) {
                    None | Some(serde_json::Value::Null) => Algorithm::default(),
                    Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                        Algorithm::default()
                    }
                    Some(serde_json::Value::String(s)) => s.parse()?,
                    Some(other) => {
                        return Err(ValidationError::InvalidParameters(format!(
                            "method must be a string, got {other}"
                        )));
                    }
                };

                Ok(Self::PiCalculation(CalculationParams { digits, method }))
            }
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::PiCalculation(_) => JobType::PiCalculation,
        }
    }

    pub fn work_size(&self) -> u64 {
        match self {
            Self::PiCalculation(p) => p.digits,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::PiCalculation(p) => p.method,
        }
    }

    pub fn compute_request(&self) -> ComputeRequest {
        ComputeRequest {
            work_size: self.work_size(),
            algorithm: self.algorithm(),
        }
    }
}

fn parse_work_size(value: &serde_json::Value) -> Result<u64, ValidationError> {
    let parsed = match value {
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u)
            } else if n.as_i64().is_some_and(|i| i <= 0) {
                return Err(ValidationError::NonPositiveWorkSize);
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f > 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f as u64)
            }
        }
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(0) => Err(ValidationError::NonPositiveWorkSize),
        Some(n) => Ok(n),
        None => Err(ValidationError::InvalidParameters(format!(
            "digits must be a positive integer, got {value}"
        ))),
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet queued.
    Submitted,
    /// Waiting in its tier queue.
    Queued,
    /// Owned by a worker.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Submitted,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Submitted, Queued) | (Submitted, Failed) | (Submitted, Cancelled) |
            (Queued, Running) | (Queued, Failed) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job still counts against capacity.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a cancel request is accepted in this status.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Submitted | Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How a job was paid for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentReference {
    /// A ledger transfer to be verified by the payment gate.
    Transaction(String),
    /// Funds held in escrow by the marketplace contract.
    Escrow(u64),
}

impl PaymentReference {
    /// Escrowed jobs come only from the marketplace contract.
    pub fn is_escrow(&self) -> bool {
        matches!(self, Self::Escrow(_))
    }
}

impl std::fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transaction(hash) => write!(f, "tx:{hash}"),
            Self::Escrow(id) => write!(f, "escrow:{id}"),
        }
    }
}

/// A unit of paid computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub parameters: JobParameters,
    pub status: JobStatus,
    pub tier: Tier,
    /// Rank of the tier at submission; higher runs first.
    pub priority: u8,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 0 to 100, non-decreasing while running.
    pub progress: u8,
    pub result: Option<ComputeOutput>,
    pub error: Option<String>,
    pub payment_reference: PaymentReference,
    pub payment_verified: bool,
    pub price: PriceBreakdown,
    pub client: String,
}

impl Job {
    /// Transition to a new status, stamping start and completion times.
    pub(crate) fn transition_to(&mut self, next: JobStatus) -> Result<(), JobStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        self.status = next;
        match next {
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Wall-clock time spent running, if started.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.started_at
            .map(|start| self.completed_at.unwrap_or_else(Utc::now) - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn terminal_statuses() {
        for status in JobStatus::ALL {
            assert_eq!(status.is_terminal(), !status.is_cancellable());
        }
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Running.is_active());
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn decode_calculation_parameters() {
        let params =
            JobParameters::decode(JobType::PiCalculation, &json!({"digits": 250, "method": "bailey"}))
                .unwrap();
        assert_eq!(params.work_size(), 250);
        assert_eq!(params.algorithm(), Algorithm::Bailey);

        let params =
            JobParameters::decode(JobType::PiCalculation, &json!({"work_size": "42"})).unwrap();
        assert_eq!(params.work_size(), 42);
        assert_eq!(params.algorithm(), Algorithm::Chudnovsky);

        let params =
            JobParameters::decode(JobType::PiCalculation, &json!({"digits": 1000.0})).unwrap();
        assert_eq!(params.work_size(), 1000);
    }

    #[test]
    fn decode_rejects_bad_parameters() {
        let decode = |v| JobParameters::decode(JobType::PiCalculation, &v);
        assert_eq!(decode(json!({})), Err(ValidationError::MissingField("digits")));
        assert_eq!(
            decode(json!({"digits": 0})),
            Err(ValidationError::NonPositiveWorkSize)
        );
        assert_eq!(
            decode(json!({"digits": -5})),
            Err(ValidationError::NonPositiveWorkSize)
        );
        assert!(matches!(
            decode(json!({"digits": 10, "method": "gauss"})),
            Err(ValidationError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            decode(json!({"digits": 1.5})),
            Err(ValidationError::InvalidParameters(_))
        ));
        assert!(matches!(
            decode(json!([1, 2])),
            Err(ValidationError::InvalidParameters(_))
        ));
    }

    #[test]
    fn parse_job_type() {
        assert_eq!("pi_calculation".parse::<JobType>().unwrap(), JobType::PiCalculation);
        assert!(matches!(
            "render".parse::<JobType>(),
            Err(ValidationError::UnknownJobType(_))
        ));
    }

    #[test]
    fn escrow_is_recognised() {
        assert!(PaymentReference::Escrow(7).is_escrow());
        assert!(!PaymentReference::Transaction("ABC".into()).is_escrow());
        assert_eq!(PaymentReference::Escrow(7).to_string(), "escrow:7");
    }
}
