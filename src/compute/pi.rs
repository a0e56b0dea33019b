//! Built-in π strategies.

use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::fixed::FixedPoint;
use super::{
    Algorithm, CANCEL_POLL_INTERVAL, ComputeOutput, ComputeRequest, ComputeStrategy,
    ProgressReporter,
};
use crate::error::ComputeError;

/// Largest supported digit count.
pub const MAX_DIGITS: u64 = 100_000;

/// First 100 decimal places of π.
pub const KNOWN_PI: &str = "3.\
    1415926535897932384626433832795028841971693993751058209749445923078164062862089986280348253421170679";

/// Decimal digits contributed by each Chudnovsky term (log10 of 151931373056000).
const CHUDNOVSKY_DIGITS_PER_TERM: f64 = 14.181_647_462_725_477;

/// 640320³ / 24.
const CHUDNOVSKY_C3_OVER_24: u64 = 10_939_058_860_032_000;

/// Whether `value` agrees with the known digits of π as far as both go.
pub fn matches_known_prefix(value: &str) -> bool {
    let n = value.len().min(KNOWN_PI.len());
    n > 2 && value[..n] == KNOWN_PI[..n]
}

fn validate(request: &ComputeRequest, max: u64) -> Result<u64, ComputeError> {
    match request.work_size {
        0 => Err(ComputeError::InvalidSize {
            work_size: 0,
            reason: "at least one digit is required".to_string(),
        }),
        n if n > max => Err(ComputeError::InvalidSize {
            work_size: n,
            reason: format!("maximum is {max} digits"),
        }),
        n => Ok(n),
    }
}

/// Polls cancellation and reports progress while a series is summed.
struct SeriesTicker<'a> {
    progress: &'a ProgressReporter,
    cancel: &'a CancellationToken,
    expected: u64,
    done: u64,
    end: u8,
}

impl<'a> SeriesTicker<'a> {
    fn new(
        progress: &'a ProgressReporter,
        cancel: &'a CancellationToken,
        expected: u64,
        end: u8,
    ) -> Result<Self, ComputeError> {
        if cancel.is_cancelled() {
            return Err(ComputeError::Cancelled);
        }
        Ok(Self {
            progress,
            cancel,
            expected,
            done: 0,
            end,
        })
    }

    fn tick(&mut self) -> Result<(), ComputeError> {
        self.done += 1;
        if self.done % CANCEL_POLL_INTERVAL == 0 {
            if self.cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            self.progress
                .report_fraction(self.done, self.expected, 0, self.end);
        }
        Ok(())
    }
}

fn finish(
    value: &FixedPoint,
    digits: u64,
    algorithm: Algorithm,
    iterations: u64,
    started: Instant,
) -> ComputeOutput {
    let value = value.to_decimal_string(digits as usize);
    ComputeOutput {
        verified: matches_known_prefix(&value),
        value,
        digits,
        algorithm,
        iterations,
        elapsed_ms: started.elapsed().as_millis() as u64,
        computed_at: Utc::now(),
    }
}

/// `ceil(log2(x))` for `x >= 1`.
fn ceil_log2(x: u64) -> u32 {
    x.max(1).next_power_of_two().trailing_zeros()
}

// ── Chudnovsky ──────────────────────────────────────────────────────

/// Chudnovsky series, finished with Newton iterations for the reciprocal of
/// the series sum and the inverse square root of 10005.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChudnovskyStrategy;

impl ChudnovskyStrategy {
    /// Newton steps needed to grow a float seed to `digits` places.
    fn newton_steps(digits: u64) -> u32 {
        ceil_log2(digits / 14) + 2
    }
}

impl ComputeStrategy for ChudnovskyStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Chudnovsky
    }

    fn compute(
        &self,
        request: &ComputeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError> {
        let digits = validate(request, self.max_work_size())?;
        let started = Instant::now();
        let frac = FixedPoint::frac_limbs_for(digits);
        let precision = (frac * 9) as f64;
        let terms = (precision / CHUDNOVSKY_DIGITS_PER_TERM).ceil() as u64 + 1;

        // S = Σ a_k (13591409 + 545140134 k), a_k alternating in sign.
        let mut ticker = SeriesTicker::new(progress, cancel, terms, 80)?;
        let mut positive = FixedPoint::zero(frac);
        let mut negative = FixedPoint::zero(frac);
        let mut a = FixedPoint::from_int(1, frac);
        let mut k = 0u64;
        while k < terms {
            if k > 0 {
                a = a
                    .mul_small((6 * k - 5) * (2 * k - 1) * (6 * k - 1))
                    .div_small(k * k * k)
                    .div_small(CHUDNOVSKY_C3_OVER_24);
                if a.is_zero() {
                    break;
                }
            }
            let mut term = a.mul_small(13_591_409);
            term.add_assign(&a.mul_small(545_140_134 * k));
            if k % 2 == 0 {
                positive.add_assign(&term);
            } else {
                negative.add_assign(&term);
            }
            k += 1;
            ticker.tick()?;
        }
        positive.sub_assign(&negative);
        let sum = positive.div_small(10_000_000);

        let steps = Self::newton_steps(digits);
        let total_steps = u64::from(steps) * 2;
        let mut step = 0u64;
        let newton_tick = |step: &mut u64| -> Result<(), ComputeError> {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            *step += 1;
            progress.report_fraction(*step, total_steps, 80, 95);
            Ok(())
        };

        // r = 1 / sum
        let two = FixedPoint::from_int(2, frac);
        let mut r = FixedPoint::from_f64(1.0 / sum.to_f64(), frac);
        for _ in 0..steps {
            newton_tick(&mut step)?;
            let mut correction = two.clone();
            correction.sub_assign(&sum.mul(&r));
            r = r.mul(&correction);
        }

        // y = 1 / sqrt(10005)
        let three = FixedPoint::from_int(3, frac);
        let mut y = FixedPoint::from_f64(1.0 / 10005f64.sqrt(), frac);
        for _ in 0..steps {
            newton_tick(&mut step)?;
            let mut correction = three.clone();
            correction.sub_assign(&y.mul(&y).mul_small(10_005));
            y = y.mul(&correction).div_small(2);
        }

        // π = 426880 · sqrt(10005) / S, with sqrt(10005) = 10005 · y and S = 10^7 · sum.
        let pi = y
            .mul_small(426_880)
            .mul_small(10_005)
            .mul(&r)
            .div_small(10_000_000);

        Ok(finish(&pi, digits, self.algorithm(), k + step, started))
    }
}

// ── Machin ──────────────────────────────────────────────────────────

/// Machin's formula: π = 16·arctan(1/5) − 4·arctan(1/239).
#[derive(Debug, Default, Clone, Copy)]
pub struct MachinStrategy;

impl MachinStrategy {
    fn arctan_inverse(
        x: u64,
        frac: usize,
        ticker: &mut SeriesTicker<'_>,
    ) -> Result<FixedPoint, ComputeError> {
        let x_squared = x * x;
        let mut power = FixedPoint::from_int(1, frac).div_small(x);
        let mut positive = FixedPoint::zero(frac);
        let mut negative = FixedPoint::zero(frac);
        let mut k = 0u64;
        while !power.is_zero() {
            let term = power.div_small(2 * k + 1);
            if k % 2 == 0 {
                positive.add_assign(&term);
            } else {
                negative.add_assign(&term);
            }
            power = power.div_small(x_squared);
            k += 1;
            ticker.tick()?;
        }
        positive.sub_assign(&negative);
        Ok(positive)
    }
}

impl ComputeStrategy for MachinStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Machin
    }

    fn compute(
        &self,
        request: &ComputeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError> {
        let digits = validate(request, self.max_work_size())?;
        let started = Instant::now();
        let frac = FixedPoint::frac_limbs_for(digits);
        let precision = (frac * 9) as f64;
        let expected = (precision / (2.0 * 5f64.log10()) + precision / (2.0 * 239f64.log10()))
            .ceil() as u64;

        let mut ticker = SeriesTicker::new(progress, cancel, expected, 95)?;
        let mut pi = Self::arctan_inverse(5, frac, &mut ticker)?.mul_small(16);
        let tail = Self::arctan_inverse(239, frac, &mut ticker)?.mul_small(4);
        pi.sub_assign(&tail);

        Ok(finish(&pi, digits, self.algorithm(), ticker.done, started))
    }
}

// ── Bailey–Borwein–Plouffe ──────────────────────────────────────────

/// BBP series: π = Σ 16⁻ᵏ (4/(8k+1) − 2/(8k+4) − 1/(8k+5) − 1/(8k+6)).
#[derive(Debug, Default, Clone, Copy)]
pub struct BaileyStrategy;

impl ComputeStrategy for BaileyStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Bailey
    }

    fn compute(
        &self,
        request: &ComputeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ComputeOutput, ComputeError> {
        let digits = validate(request, self.max_work_size())?;
        let started = Instant::now();
        let frac = FixedPoint::frac_limbs_for(digits);
        let expected = ((frac * 9) as f64 / 16f64.log10()).ceil() as u64;

        let mut ticker = SeriesTicker::new(progress, cancel, expected, 95)?;
        let mut positive = FixedPoint::zero(frac);
        let mut negative = FixedPoint::zero(frac);
        let mut power = FixedPoint::from_int(1, frac);
        let mut k = 0u64;
        while !power.is_zero() {
            let eight_k = 8 * k;
            positive.add_assign(&power.mul_small(4).div_small(eight_k + 1));
            negative.add_assign(&power.mul_small(2).div_small(eight_k + 4));
            negative.add_assign(&power.div_small(eight_k + 5));
            negative.add_assign(&power.div_small(eight_k + 6));
            power = power.div_small(16);
            k += 1;
            ticker.tick()?;
        }
        positive.sub_assign(&negative);

        Ok(finish(&positive, digits, self.algorithm(), k, started))
    }
}
