//! Pricing: tiers, algorithm multipliers and cost breakdowns.

pub mod engine;
pub mod tier;

pub use engine::{MethodInfo, PriceBreakdown, PricingEngine, PricingInfo, estimate_time};
pub use tier::{Tier, TierDefinition};
