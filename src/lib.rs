//! Compute marketplace core: tiered pricing, payment-gated admission and a
//! priority worker pool for paid computations.

pub mod bridge;
pub mod compute;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod payment;
pub mod pricing;
pub mod service;
