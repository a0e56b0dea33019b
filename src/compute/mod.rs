//! Computation strategies.
//!
//! A strategy performs one unit of CPU-bound work on the blocking pool,
//! reports integer progress through a [`ProgressReporter`] and polls a
//! [`CancellationToken`] at least once every [`CANCEL_POLL_INTERVAL`] series
//! terms. There is no checkpoint/resume: a cancelled job starts over when
//! resubmitted.

pub mod fixed;
pub mod pi;
pub mod progress;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, ValidationError};

pub use pi::{BaileyStrategy, ChudnovskyStrategy, MachinStrategy};
pub use progress::ProgressReporter;

/// Number of series terms a strategy may evaluate between cancellation checks.
pub const CANCEL_POLL_INTERVAL: u64 = 64;

/// Closed set of supported algorithms.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Chudnovsky,
    Machin,
    Bailey,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Chudnovsky, Algorithm::Machin, Algorithm::Bailey];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chudnovsky => "chudnovsky",
            Self::Machin => "machin",
            Self::Bailey => "bailey",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chudnovsky" => Ok(Self::Chudnovsky),
            "machin" => Ok(Self::Machin),
            "bailey" | "bbp" => Ok(Self::Bailey),
            other => Err(ValidationError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// One unit of work handed to a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeRequest {
    /// Number of decimal places to produce.
    pub work_size: u64,
    pub algorithm: Algorithm,
}

/// Result of a successful computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOutput {
    /// The computed value, e.g. `"3.14159"`.
    pub value: String,
    pub digits: u64,
    pub algorithm: Algorithm,
    /// Series terms (or Newton steps) evaluated.
    pub iterations: u64,
    pub elapsed_ms: u64,
    /// Whether the leading digits match the known reference prefix.
    pub verified: bool,
    pub computed_at: DateTime<Utc>,
}

/// A pluggable algorithm.
///
/// `compute` is synchronous and CPU-bound; callers run it on the blocking pool.
pub trait ComputeStrategy: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Largest work size this strategy accepts.
    fn max_work_size(&self) -> u64 {
        pi::MAX_DIGITS
    }

    fn compute(
        &self,
        request: &ComputeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError>;
}

/// Registry of available strategies, keyed by algorithm.
pub struct StrategyRegistry {
    strategies: HashMap<Algorithm, Arc<dyn ComputeStrategy>>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding the three built-in π strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ChudnovskyStrategy));
        registry.register(Arc::new(MachinStrategy));
        registry.register(Arc::new(BaileyStrategy));
        registry
    }

    /// Register a strategy, replacing any existing one for the same algorithm.
    pub fn register(&mut self, strategy: Arc<dyn ComputeStrategy>) {
        let algorithm = strategy.algorithm();
        if self.strategies.insert(algorithm, strategy).is_some() {
            tracing::debug!(%algorithm, "Replaced compute strategy");
        } else {
            tracing::debug!(%algorithm, "Registered compute strategy");
        }
    }

    pub fn get(&self, algorithm: Algorithm) -> Result<Arc<dyn ComputeStrategy>, ComputeError> {
        self.strategies
            .get(&algorithm)
            .cloned()
            .ok_or_else(|| ComputeError::UnknownAlgorithm(algorithm.to_string()))
    }

    pub fn has(&self, algorithm: Algorithm) -> bool {
        self.strategies.contains_key(&algorithm)
    }

    pub fn count(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoStrategy;

    impl ComputeStrategy for EchoStrategy {
        fn algorithm(&self) -> Algorithm {
            Algorithm::Machin
        }

        fn compute(
            &self,
            request: &ComputeRequest,
            _progress: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> Result<ComputeOutput, ComputeError> {
            Ok(ComputeOutput {
                value: "echo".to_string(),
                digits: request.work_size,
                algorithm: request.algorithm,
                iterations: 0,
                elapsed_ms: 0,
                verified: false,
                computed_at: Utc::now(),
            })
        }
    }

    #[test]
    fn parse_algorithm_names() {
        assert_eq!("Chudnovsky".parse::<Algorithm>().unwrap(), Algorithm::Chudnovsky);
        assert_eq!("bbp".parse::<Algorithm>().unwrap(), Algorithm::Bailey);
        assert!(matches!(
            "monte_carlo".parse::<Algorithm>(),
            Err(ValidationError::UnknownAlgorithm(_))
        ));
        assert_eq!(Algorithm::default(), Algorithm::Chudnovsky);
    }

    #[test]
    fn builtin_registry_covers_every_algorithm() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.count(), 3);
        for algorithm in Algorithm::ALL {
            assert_eq!(registry.get(algorithm).unwrap().algorithm(), algorithm);
        }
    }

    #[test]
    fn register_overrides_existing_strategy() {
        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(EchoStrategy));
        assert_eq!(registry.count(), 3);

        let (reporter, _rx) = ProgressReporter::channel(4);
        let output = registry
            .get(Algorithm::Machin)
            .unwrap()
            .compute(
                &ComputeRequest {
                    work_size: 5,
                    algorithm: Algorithm::Machin,
                },
                &reporter,
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(output.value, "echo");
    }

    #[test]
    fn empty_registry_reports_unknown_algorithm() {
        let registry = StrategyRegistry::new();
        assert!(!registry.has(Algorithm::Bailey));
        assert!(matches!(
            registry.get(Algorithm::Bailey),
            Err(ComputeError::UnknownAlgorithm(a)) if a == "bailey"
        ));
    }
}
