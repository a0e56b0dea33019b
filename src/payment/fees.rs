//! Fee distribution to the community pool.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::config::PaymentConfig;
use crate::error::PaymentError;
use crate::jobs::JobId;
use crate::ledger::{BroadcastResult, Coin, Ledger, LedgerCall};

/// Longest wait between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before attempt `attempt + 1`: exponential from `initial`, capped,
/// plus up to 50% random jitter.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let base = initial
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF);
    let jitter_ms = (base.as_millis() as u64) / 2;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Sends the fee share of verified jobs to the community address.
pub struct FeeDistributor {
    ledger: Arc<dyn Ledger>,
    community_address: String,
    denom: String,
    units_per_token: u64,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl FeeDistributor {
    pub fn new(ledger: Arc<dyn Ledger>, config: &PaymentConfig) -> Self {
        Self {
            ledger,
            community_address: config.community_address.clone(),
            denom: config.denom.clone(),
            units_per_token: config.units_per_token,
            max_attempts: config.fee_max_attempts.max(1),
            initial_backoff: config.fee_retry_backoff,
        }
    }

    /// Base units for a fee of `fee` tokens, rounded down.
    pub fn fee_units(&self, fee: Decimal) -> Result<u128, PaymentError> {
        if fee < Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(fee));
        }
        fee.checked_mul(Decimal::from(self.units_per_token))
            .and_then(|v| v.floor().to_u128())
            .ok_or(PaymentError::InvalidAmount(fee))
    }

    /// Transfer the fee for `job`, retrying with backoff.
    ///
    /// Returns `Ok(None)` when there is nothing to send.
    pub async fn distribute(
        &self,
        job: JobId,
        fee: Decimal,
    ) -> Result<Option<BroadcastResult>, PaymentError> {
        if self.community_address.is_empty() {
            warn!(job_id = %job, "No community address configured, fee not distributed");
            return Ok(None);
        }
        let units = self.fee_units(fee)?;
        if units == 0 {
            return Ok(None);
        }

        let call = LedgerCall::Send {
            to: self.community_address.clone(),
            amount: Coin::new(self.denom.clone(), units),
            memo: format!("community fee for job {job}"),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ledger.execute(call.clone()).await {
                Ok(result) => {
                    info!(
                        job_id = %job,
                        amount = %units,
                        denom = %self.denom,
                        tx_hash = %result.tx_hash,
                        attempt,
                        "Community fee distributed"
                    );
                    return Ok(Some(result));
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(job_id = %job, error = %e, attempt, "Fee distribution gave up");
                    return Err(e.into());
                }
                Err(e) => {
                    let delay = backoff_delay(self.initial_backoff, attempt);
                    warn!(
                        job_id = %job,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Fee distribution failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
