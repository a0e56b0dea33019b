//! Service tiers and their default definitions.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Named service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Basic,
    Standard,
    Premium,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Standard, Tier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            other => Err(ValidationError::UnknownTier(other.to_string())),
        }
    }
}

/// Read-only configuration of a tier, shared by all jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub name: Tier,
    /// Price per unit of work (one digit), in whole tokens.
    pub price_per_unit: Decimal,
    pub max_work_size: u64,
    #[serde(with = "duration_secs")]
    pub max_runtime: Duration,
    /// Fraction of the cost routed to the community pool.
    pub fee_percent: Decimal,
    /// Higher ranks are dispatched first.
    pub priority_rank: u8,
    pub description: String,
    /// Advertised service features, shown with every quote.
    #[serde(default)]
    pub features: Vec<String>,
}

impl TierDefinition {
    /// The stock tier table.
    pub fn defaults() -> Vec<TierDefinition> {
        vec![
            TierDefinition {
                name: Tier::Basic,
                price_per_unit: dec!(0.0001),
                max_work_size: 1_000,
                max_runtime: Duration::from_secs(5 * 60),
                fee_percent: dec!(0.15),
                priority_rank: 1,
                description: "Basic calculation for testing and learning".to_string(),
                features: features(&[
                    "Standard precision calculation",
                    "Basic result verification",
                    "Single algorithm (Chudnovsky)",
                    "Up to 1,000 digits",
                ]),
            },
            TierDefinition {
                name: Tier::Standard,
                price_per_unit: dec!(0.00025),
                max_work_size: 10_000,
                max_runtime: Duration::from_secs(30 * 60),
                fee_percent: dec!(0.15),
                priority_rank: 2,
                description: "Standard service with progress monitoring".to_string(),
                features: features(&[
                    "Real-time progress updates",
                    "Multiple algorithms available",
                    "Advanced result verification",
                    "Up to 10,000 digits",
                    "Job status monitoring",
                ]),
            },
            TierDefinition {
                name: Tier::Premium,
                price_per_unit: dec!(0.0005),
                max_work_size: 100_000,
                max_runtime: Duration::from_secs(120 * 60),
                fee_percent: dec!(0.15),
                priority_rank: 3,
                description: "Premium service with highest priority".to_string(),
                features: features(&[
                    "Highest priority processing",
                    "All calculation algorithms",
                    "Guaranteed completion",
                    "Up to 100,000 digits",
                    "Performance analytics",
                ]),
            },
        ]
    }
}

fn features(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
