//! Payment verification against ledger truth.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PaymentConfig;
use crate::error::{LedgerError, PaymentError};
use crate::jobs::PaymentReference;
use crate::ledger::{ContractJob, Ledger, TxRecord};

/// Contract status of a job whose escrow is still held.
const ESCROW_OPEN_STATUS: &str = "submitted";

/// A successfully verified payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub tx_hash: String,
    pub payer: String,
    pub recipient: String,
    pub denom: String,
    /// Base units actually received.
    pub received: u128,
    /// Minimum base units accepted after tolerance.
    pub required: u128,
    pub height: u64,
    /// Present when confirmations were awaited.
    pub confirmations: Option<u64>,
    pub verified_at: DateTime<Utc>,
}

/// Escrow the marketplace contract holds for one of our jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowVerification {
    pub job_id: u64,
    pub client: String,
    pub provider: String,
    /// Base units held by the contract.
    pub held: u128,
    pub required: u128,
    pub verified_at: DateTime<Utc>,
}

/// Checks claimed payments against the ledger.
///
/// A payment redeemed for a job stays redeemed for the life of the gate, so
/// one transfer or escrow can only ever pay for one job.
pub struct PaymentGate {
    ledger: Arc<dyn Ledger>,
    config: PaymentConfig,
    redeemed: Mutex<HashSet<PaymentReference>>,
}

/// A reservation on a payment reference, released on drop unless kept.
struct Claim<'a> {
    gate: &'a PaymentGate,
    reference: Option<PaymentReference>,
}

impl Claim<'_> {
    fn keep(mut self) {
        self.reference = None;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(reference) = self.reference.take() {
            self.gate.release(&reference);
        }
    }
}

/// Transaction hashes are hex and compared case-insensitively.
fn tx_reference(tx_hash: &str) -> PaymentReference {
    PaymentReference::Transaction(tx_hash.trim().to_ascii_uppercase())
}

impl PaymentGate {
    pub fn new(ledger: Arc<dyn Ledger>, config: PaymentConfig) -> Self {
        Self {
            ledger,
            config,
            redeemed: Mutex::new(HashSet::new()),
        }
    }

    fn redeemed(&self) -> MutexGuard<'_, HashSet<PaymentReference>> {
        self.redeemed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, reference: PaymentReference) -> Result<Claim<'_>, PaymentError> {
        if !self.redeemed().insert(reference.clone()) {
            return Err(PaymentError::AlreadyUsed(reference.to_string()));
        }
        Ok(Claim {
            gate: self,
            reference: Some(reference),
        })
    }

    /// Make a payment reference redeemable again.
    pub(crate) fn release(&self, reference: &PaymentReference) {
        self.redeemed().remove(reference);
    }

    /// Whether a payment has already paid for a job.
    pub fn is_redeemed(&self, reference: &PaymentReference) -> bool {
        let key = match reference {
            PaymentReference::Transaction(hash) => tx_reference(hash),
            escrow => escrow.clone(),
        };
        self.redeemed().contains(&key)
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Minimum base units accepted for a payment of `expected` tokens.
    pub fn required_units(&self, expected: Decimal) -> Result<u128, PaymentError> {
        if expected <= Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(expected));
        }
        let units = expected
            .checked_mul(Decimal::from(self.config.units_per_token))
            .and_then(|v| v.checked_mul(Decimal::ONE - self.config.tolerance))
            .ok_or(PaymentError::InvalidAmount(expected))?;
        units
            .ceil()
            .to_u128()
            .ok_or(PaymentError::InvalidAmount(expected))
    }

    /// Verify that `tx_hash` pays at least `expected` tokens from `payer` to
    /// the service address. Bounded by the configured verification timeout.
    pub async fn verify_payment(
        &self,
        tx_hash: &str,
        payer: &str,
        expected: Decimal,
    ) -> Result<PaymentVerification, PaymentError> {
        let timeout = self.config.verification_timeout;
        match tokio::time::timeout(timeout, self.verify_inner(tx_hash, payer, expected)).await {
            Ok(result) => {
                match &result {
                    Ok(v) => info!(
                        tx_hash,
                        payer,
                        received = %v.received,
                        required = %v.required,
                        "Payment verified"
                    ),
                    Err(e) => warn!(tx_hash, payer, error = %e, "Payment verification failed"),
                }
                result
            }
            Err(_) => {
                warn!(tx_hash, timeout_secs = timeout.as_secs(), "Payment verification timed out");
                Err(PaymentError::Timeout(timeout))
            }
        }
    }

    /// Verify a transfer and consume it for one job.
    ///
    /// A second redemption of the same hash fails with `AlreadyUsed`, even
    /// while the first is still being verified. A failed verification leaves
    /// the hash redeemable.
    pub async fn redeem_payment(
        &self,
        tx_hash: &str,
        payer: &str,
        expected: Decimal,
    ) -> Result<PaymentVerification, PaymentError> {
        let claim = self.claim(tx_reference(tx_hash)).inspect_err(|e| {
            warn!(tx_hash, payer, error = %e, "Payment reuse rejected");
        })?;
        let verification = self.verify_payment(tx_hash, payer, expected).await?;
        claim.keep();
        Ok(verification)
    }

    /// Check that a contract job's escrow is open, addressed to `provider`
    /// and covers `expected` tokens, then consume it for one local job.
    pub fn redeem_escrow(
        &self,
        job: &ContractJob,
        provider: &str,
        expected: Decimal,
    ) -> Result<EscrowVerification, PaymentError> {
        let claim = self.claim(PaymentReference::Escrow(job.id))?;
        let verification = self.check_escrow(job, provider, expected).inspect_err(|e| {
            warn!(contract_job = job.id, error = %e, "Escrow rejected");
        })?;
        claim.keep();
        debug!(contract_job = job.id, held = %verification.held, "Escrow verified");
        Ok(verification)
    }

    fn check_escrow(
        &self,
        job: &ContractJob,
        provider: &str,
        expected: Decimal,
    ) -> Result<EscrowVerification, PaymentError> {
        let rejected = |reason: String| PaymentError::EscrowRejected {
            job_id: job.id,
            reason,
        };
        if !job.status.trim().eq_ignore_ascii_case(ESCROW_OPEN_STATUS) {
            return Err(rejected(format!("job status is '{}'", job.status)));
        }
        if job.provider != provider {
            return Err(rejected(format!("job is assigned to '{}'", job.provider)));
        }
        if job.client.trim().is_empty() {
            return Err(rejected("job has no client".to_string()));
        }
        let held: u128 = job
            .payment_amount
            .trim()
            .parse()
            .map_err(|_| rejected(format!("unreadable payment amount '{}'", job.payment_amount)))?;
        let required = self.required_units(expected)?;
        if held < required {
            return Err(PaymentError::InsufficientAmount {
                received: held,
                required,
                denom: self.config.denom.clone(),
            });
        }
        Ok(EscrowVerification {
            job_id: job.id,
            client: job.client.clone(),
            provider: job.provider.clone(),
            held,
            required,
            verified_at: Utc::now(),
        })
    }

    async fn verify_inner(
        &self,
        tx_hash: &str,
        payer: &str,
        expected: Decimal,
    ) -> Result<PaymentVerification, PaymentError> {
        let required = self.required_units(expected)?;
        let tx = self.ledger.query_tx(tx_hash).await?;

        if !tx.succeeded() {
            return Err(PaymentError::TransactionFailed {
                tx_hash: tx.hash,
                code: tx.code,
                log: tx.raw_log,
            });
        }

        let received = self.received_from(&tx, payer);
        if received == 0 {
            return Err(PaymentError::TransferNotFound {
                tx_hash: tx.hash,
                payer: payer.to_string(),
                recipient: self.config.service_address.clone(),
            });
        }
        if received < required {
            return Err(PaymentError::InsufficientAmount {
                received,
                required,
                denom: self.config.denom.clone(),
            });
        }

        let confirmations = if self.config.wait_for_confirmations {
            Some(self.await_confirmations(tx.height).await?)
        } else {
            None
        };

        Ok(PaymentVerification {
            tx_hash: tx.hash,
            payer: payer.to_string(),
            recipient: self.config.service_address.clone(),
            denom: self.config.denom.clone(),
            received,
            required,
            height: tx.height,
            confirmations,
            verified_at: Utc::now(),
        })
    }

    /// Sum of all transfers from `payer` to the service address in our denom.
    fn received_from(&self, tx: &TxRecord, payer: &str) -> u128 {
        tx.transfers
            .iter()
            .filter(|t| t.from == payer && t.to == self.config.service_address)
            .map(|t| t.amount_of(&self.config.denom))
            .sum()
    }

    async fn confirmations(&self, tx_height: u64) -> Result<u64, LedgerError> {
        let latest = self.ledger.latest_height().await?;
        if latest < tx_height {
            return Ok(0);
        }
        Ok(latest - tx_height + 1)
    }

    async fn await_confirmations(&self, tx_height: u64) -> Result<u64, PaymentError> {
        let required = self.config.min_confirmations;
        let deadline = Instant::now() + self.confirmation_budget();
        loop {
            let confirmations = self.confirmations(tx_height).await?;
            if confirmations >= required {
                return Ok(confirmations);
            }
            debug!(tx_height, confirmations, required, "Waiting for confirmations");
            if Instant::now() + self.config.confirmation_poll_interval > deadline {
                return Err(PaymentError::InsufficientConfirmations {
                    confirmations,
                    required,
                });
            }
            tokio::time::sleep(self.config.confirmation_poll_interval).await;
        }
    }

    /// Confirmation polling stops slightly before the overall timeout so the
    /// caller sees the confirmation count rather than a bare timeout.
    fn confirmation_budget(&self) -> Duration {
        self.config
            .verification_timeout
            .saturating_sub(self.config.confirmation_poll_interval)
    }
}
