//! Price calculation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::tier::{Tier, TierDefinition};
use crate::compute::Algorithm;
use crate::error::ValidationError;

/// Currency prices are quoted in.
pub const DEFAULT_CURRENCY: &str = "MEDAS";

/// Immutable cost breakdown for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub tier: Tier,
    pub work_size: u64,
    pub algorithm: Algorithm,
    pub base_cost: Decimal,
    /// Share kept by the provider.
    pub provider_share: Decimal,
    /// Share routed to the community pool.
    pub fee_share: Decimal,
    pub total_cost: Decimal,
    pub currency: String,
    pub estimated_time_ms: u64,
    pub summary: String,
    /// Features of the quoted tier.
    pub features: Vec<String>,
}

/// How one algorithm behaves for a given work size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub algorithm: Algorithm,
    pub work_size: u64,
    pub estimated_time_ms: u64,
    pub convergence_rate: String,
    pub description: String,
    pub complexity: String,
    pub price_multiplier: Decimal,
}

/// Pricing overview for clients.
#[derive(Debug, Clone, Serialize)]
pub struct PricingInfo {
    pub tiers: Vec<TierDefinition>,
    pub currency: String,
    pub fee_address: String,
    pub algorithm_multipliers: Vec<(Algorithm, Decimal)>,
    pub generated_at: DateTime<Utc>,
}

/// Maps (work size, tier, algorithm) to a price. Pure and deterministic.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    /// Sorted by ascending priority rank.
    tiers: Vec<TierDefinition>,
    currency: String,
    fee_address: String,
}

impl PricingEngine {
    /// Create an engine with the stock tier table.
    pub fn new(fee_address: impl Into<String>) -> Self {
        Self::with_tiers(fee_address, TierDefinition::defaults())
    }

    /// Create an engine with a custom tier table.
    pub fn with_tiers(fee_address: impl Into<String>, mut tiers: Vec<TierDefinition>) -> Self {
        tiers.sort_by_key(|t| t.priority_rank);
        tiers.dedup_by_key(|t| t.name);
        Self {
            tiers,
            currency: DEFAULT_CURRENCY.to_string(),
            fee_address: fee_address.into(),
        }
    }

    /// Look up a tier definition.
    pub fn tier(&self, tier: Tier) -> Result<&TierDefinition, ValidationError> {
        self.tiers
            .iter()
            .find(|t| t.name == tier)
            .ok_or_else(|| ValidationError::UnknownTier(tier.to_string()))
    }

    /// All tier definitions, lowest rank first.
    pub fn tiers(&self) -> &[TierDefinition] {
        &self.tiers
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Price multiplier for an algorithm.
    pub fn algorithm_multiplier(algorithm: Algorithm) -> Decimal {
        match algorithm {
            Algorithm::Chudnovsky => dec!(1.0),
            Algorithm::Machin => dec!(1.3),
            Algorithm::Bailey => dec!(1.2),
        }
    }

    /// Validate size limits without pricing.
    pub fn validate_limits(&self, work_size: u64, tier: Tier) -> Result<(), ValidationError> {
        let def = self.tier(tier)?;
        if work_size == 0 {
            return Err(ValidationError::NonPositiveWorkSize);
        }
        if work_size > def.max_work_size {
            return Err(ValidationError::WorkSizeExceedsTier {
                work_size,
                tier: tier.to_string(),
                max: def.max_work_size,
            });
        }
        Ok(())
    }

    /// Calculate the full price of a job.
    ///
    /// `algorithm` defaults to Chudnovsky. Identical inputs always produce an
    /// identical breakdown; payment matching depends on that.
    pub fn calculate_price(
        &self,
        work_size: u64,
        tier: Tier,
        algorithm: Option<Algorithm>,
    ) -> Result<PriceBreakdown, ValidationError> {
        self.validate_limits(work_size, tier)?;
        let def = self.tier(tier)?;
        let algorithm = algorithm.unwrap_or_default();

        let base_cost =
            Decimal::from(work_size) * def.price_per_unit * Self::algorithm_multiplier(algorithm);
        let fee_share = base_cost * def.fee_percent;
        let provider_share = base_cost - fee_share;
        let total_cost = base_cost;

        let fee_pct = def.fee_percent * dec!(100);
        let summary = format!(
            "{} {} ({}% provider + {}% community pool)",
            total_cost.round_dp(6),
            self.currency,
            (dec!(100) - fee_pct).normalize(),
            fee_pct.normalize(),
        );

        Ok(PriceBreakdown {
            tier,
            work_size,
            algorithm,
            base_cost,
            provider_share,
            fee_share,
            total_cost,
            currency: self.currency.clone(),
            estimated_time_ms: estimate_time(work_size, algorithm).as_millis() as u64,
            summary,
            features: def.features.clone(),
        })
    }

    /// Price the request on every tier that can take it, lowest rank first.
    pub fn compare_tiers(
        &self,
        work_size: u64,
        algorithm: Option<Algorithm>,
    ) -> Result<Vec<PriceBreakdown>, ValidationError> {
        if work_size == 0 {
            return Err(ValidationError::NonPositiveWorkSize);
        }
        let quotes: Vec<PriceBreakdown> = self
            .tiers
            .iter()
            .filter_map(|t| self.calculate_price(work_size, t.name, algorithm).ok())
            .collect();

        if quotes.is_empty() {
            return Err(ValidationError::NoTierFits(work_size));
        }
        Ok(quotes)
    }

    /// Cheapest tier able to take `work_size`. Ties go to the lower rank.
    pub fn suggest_tier(&self, work_size: u64) -> Result<Tier, ValidationError> {
        self.compare_tiers(work_size, None)?
            .into_iter()
            .min_by_key(|q| q.total_cost)
            .map(|q| q.tier)
            .ok_or(ValidationError::NoTierFits(work_size))
    }

    /// Per-algorithm characteristics for `work_size`, in [`Algorithm::ALL`] order.
    pub fn method_info(&self, work_size: u64) -> Result<Vec<MethodInfo>, ValidationError> {
        if work_size == 0 {
            return Err(ValidationError::NonPositiveWorkSize);
        }
        Ok(Algorithm::ALL
            .iter()
            .map(|&algorithm| {
                let (convergence_rate, description, complexity) = match algorithm {
                    Algorithm::Chudnovsky => (
                        "~14.18 digits per term",
                        "Fastest converging series for pi, found by David and Gregory Chudnovsky",
                        "Heavy per-term arithmetic, excellent convergence",
                    ),
                    Algorithm::Machin => (
                        "~1.4 digits per term",
                        "Classical formula pi/4 = 4 arctan(1/5) - arctan(1/239)",
                        "Simple arithmetic, slow convergence",
                    ),
                    Algorithm::Bailey => (
                        "~1.2 digits per term",
                        "Bailey-Borwein-Plouffe series, also yields isolated hexadecimal digits",
                        "Moderate arithmetic, suited to parallel evaluation",
                    ),
                };
                MethodInfo {
                    algorithm,
                    work_size,
                    estimated_time_ms: estimate_time(work_size, algorithm).as_millis() as u64,
                    convergence_rate: convergence_rate.to_string(),
                    description: description.to_string(),
                    complexity: complexity.to_string(),
                    price_multiplier: Self::algorithm_multiplier(algorithm),
                }
            })
            .collect())
    }

    /// Pricing overview for clients.
    pub fn pricing_info(&self) -> PricingInfo {
        PricingInfo {
            tiers: self.tiers.clone(),
            currency: self.currency.clone(),
            fee_address: self.fee_address.clone(),
            algorithm_multipliers: Algorithm::ALL
                .iter()
                .map(|a| (*a, Self::algorithm_multiplier(*a)))
                .collect(),
            generated_at: Utc::now(),
        }
    }
}

/// Rough wall-clock estimate for a computation, bounded to [0.1 s, 600 s].
pub fn estimate_time(work_size: u64, algorithm: Algorithm) -> Duration {
    let digits = work_size.max(1) as f64;
    let algorithm_factor = match algorithm {
        Algorithm::Chudnovsky => 1.0,
        Algorithm::Machin => 2.5,
        Algorithm::Bailey => 1.8,
    };
    let secs = (digits / 1000.0) * algorithm_factor * (digits.ln() / 5.0) / 10.0;
    Duration::from_secs_f64(secs.clamp(0.1, 600.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PricingEngine {
        PricingEngine::new("medas1community")
    }

    #[test]
    fn basic_price_breakdown() {
        let quote = engine()
            .calculate_price(100, Tier::Basic, Some(Algorithm::Machin))
            .unwrap();
        // 100 × 0.0001 × 1.3
        assert_eq!(quote.total_cost, dec!(0.013));
        assert_eq!(quote.fee_share, dec!(0.00195));
        assert_eq!(quote.provider_share, dec!(0.01105));
        assert_eq!(quote.provider_share + quote.fee_share, quote.total_cost);
        assert_eq!(quote.currency, "MEDAS");
    }

    #[test]
    fn pricing_is_deterministic() {
        let engine = engine();
        for tier in Tier::ALL {
            for algorithm in Algorithm::ALL {
                let a = engine.calculate_price(750, tier, Some(algorithm)).unwrap();
                let b = engine.calculate_price(750, tier, Some(algorithm)).unwrap();
                assert_eq!(a.total_cost, b.total_cost);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn default_algorithm_is_chudnovsky() {
        let quote = engine().calculate_price(1000, Tier::Standard, None).unwrap();
        assert_eq!(quote.algorithm, Algorithm::Chudnovsky);
        assert_eq!(quote.total_cost, dec!(0.25));
    }

    #[test]
    fn rejects_zero_and_oversize() {
        let engine = engine();
        assert_eq!(
            engine.calculate_price(0, Tier::Basic, None),
            Err(ValidationError::NonPositiveWorkSize)
        );
        assert_eq!(
            engine.calculate_price(100_001, Tier::Premium, None),
            Err(ValidationError::WorkSizeExceedsTier {
                work_size: 100_001,
                tier: "premium".to_string(),
                max: 100_000,
            })
        );
    }

    #[test]
    fn compare_skips_tiers_that_cannot_fit() {
        let quotes = engine().compare_tiers(5_000, None).unwrap();
        let tiers: Vec<Tier> = quotes.iter().map(|q| q.tier).collect();
        assert_eq!(tiers, vec![Tier::Standard, Tier::Premium]);

        assert_eq!(
            engine().compare_tiers(200_000, None),
            Err(ValidationError::NoTierFits(200_000))
        );
    }

    #[test]
    fn suggest_cheapest_fitting_tier() {
        let engine = engine();
        assert_eq!(engine.suggest_tier(10).unwrap(), Tier::Basic);
        assert_eq!(engine.suggest_tier(1_001).unwrap(), Tier::Standard);
        assert_eq!(engine.suggest_tier(50_000).unwrap(), Tier::Premium);
        assert!(engine.suggest_tier(500_000).is_err());
    }

    #[test]
    fn suggest_prefers_cheaper_tier_even_if_ranked_higher() {
        let mut tiers = TierDefinition::defaults();
        tiers[2].price_per_unit = dec!(0.00001);
        let engine = PricingEngine::with_tiers("pool", tiers);
        assert_eq!(engine.suggest_tier(10).unwrap(), Tier::Premium);
    }

    #[test]
    fn estimate_time_is_bounded() {
        assert_eq!(estimate_time(1, Algorithm::Chudnovsky), Duration::from_millis(100));
        assert!(estimate_time(100_000, Algorithm::Machin) <= Duration::from_secs(600));
        assert!(
            estimate_time(50_000, Algorithm::Machin) > estimate_time(50_000, Algorithm::Chudnovsky)
        );
    }

    #[test]
    fn quote_carries_tier_features() {
        let engine = engine();
        let quote = engine.calculate_price(5_000, Tier::Premium, None).unwrap();
        assert_eq!(quote.features, engine.tier(Tier::Premium).unwrap().features);
        assert!(quote.features.iter().any(|f| f == "Highest priority processing"));
    }

    #[test]
    fn method_info_covers_every_algorithm() {
        let info = engine().method_info(10_000).unwrap();
        let algorithms: Vec<Algorithm> = info.iter().map(|m| m.algorithm).collect();
        assert_eq!(algorithms, Algorithm::ALL.to_vec());
        assert!(info.iter().all(|m| m.work_size == 10_000));

        let machin = &info[1];
        assert_eq!(machin.price_multiplier, dec!(1.3));
        assert_eq!(
            machin.estimated_time_ms,
            estimate_time(10_000, Algorithm::Machin).as_millis() as u64
        );
        assert!(info[0].estimated_time_ms < machin.estimated_time_ms);

        assert_eq!(engine().method_info(0), Err(ValidationError::NonPositiveWorkSize));
    }

    #[test]
    fn summary_mentions_split() {
        let quote = engine().calculate_price(100, Tier::Basic, None).unwrap();
        assert!(quote.summary.contains("85% provider"));
        assert!(quote.summary.contains("15% community pool"));
    }
}
