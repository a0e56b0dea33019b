//! Payment gate and fee distribution.

pub mod fees;
pub mod gate;

pub use fees::FeeDistributor;
pub use gate::{EscrowVerification, PaymentGate, PaymentVerification};
