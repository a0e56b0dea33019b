//! Non-negative fixed-point numbers for the series strategies.
//!
//! Limbs are big-endian in base 10^9. `limbs[0]` holds the integer part and
//! must stay below 10^9; the remaining limbs are fractional. Every operation
//! truncates, so results may be low by a few units in the last limb. Callers
//! size precision with [`FixedPoint::frac_limbs_for`], which adds guard limbs.

const BASE: u64 = 1_000_000_000;
const LIMB_DIGITS: usize = 9;

/// Extra fractional limbs carried beyond the requested digits.
pub const GUARD_LIMBS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPoint {
    limbs: Vec<u32>,
}

impl FixedPoint {
    /// Fractional limbs needed to hold `digits` decimal places plus guards.
    pub fn frac_limbs_for(digits: u64) -> usize {
        (digits as usize).div_ceil(LIMB_DIGITS) + GUARD_LIMBS
    }

    pub fn zero(frac_limbs: usize) -> Self {
        Self {
            limbs: vec![0; frac_limbs + 1],
        }
    }

    pub fn from_int(value: u32, frac_limbs: usize) -> Self {
        debug_assert!(u64::from(value) < BASE, "integer part out of range");
        let mut n = Self::zero(frac_limbs);
        n.limbs[0] = value;
        n
    }

    /// Seed value from a float, accurate to roughly 16 significant digits.
    pub fn from_f64(value: f64, frac_limbs: usize) -> Self {
        let mut n = Self::zero(frac_limbs);
        let value = value.max(0.0);
        let int = value.trunc();
        n.limbs[0] = int as u32;

        let mut frac = value - int;
        for limb in n.limbs.iter_mut().skip(1).take(2) {
            let scaled = frac * BASE as f64;
            let digit = scaled.trunc().min((BASE - 1) as f64);
            *limb = digit as u32;
            frac = scaled - digit;
        }
        n
    }

    pub fn frac_limbs(&self) -> usize {
        self.limbs.len() - 1
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    pub fn to_f64(&self) -> f64 {
        self.limbs
            .iter()
            .take(3)
            .enumerate()
            .map(|(i, &l)| f64::from(l) / (BASE as f64).powi(i as i32))
            .sum()
    }

    /// `self / divisor`. `divisor` must be non-zero.
    pub fn div_small(&self, divisor: u64) -> Self {
        debug_assert!(divisor > 0);
        let d = u128::from(divisor);
        let mut rem: u128 = 0;
        let limbs = self
            .limbs
            .iter()
            .map(|&l| {
                let cur = rem * u128::from(BASE) + u128::from(l);
                rem = cur % d;
                (cur / d) as u32
            })
            .collect();
        Self { limbs }
    }

    /// `self * factor`. The integer part of the product must stay below 10^9.
    pub fn mul_small(&self, factor: u64) -> Self {
        let m = u128::from(factor);
        let mut limbs = vec![0u32; self.limbs.len()];
        let mut carry: u128 = 0;
        for (i, &l) in self.limbs.iter().enumerate().rev() {
            let cur = u128::from(l) * m + carry;
            if i == 0 {
                debug_assert!(cur < u128::from(BASE), "integer part overflow");
                limbs[0] = cur as u32;
            } else {
                limbs[i] = (cur % u128::from(BASE)) as u32;
                carry = cur / u128::from(BASE);
            }
        }
        Self { limbs }
    }

    pub fn add_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.limbs.len(), other.limbs.len());
        let mut carry = 0u64;
        for (a, &b) in self.limbs.iter_mut().zip(&other.limbs).rev() {
            let sum = u64::from(*a) + u64::from(b) + carry;
            *a = (sum % BASE) as u32;
            carry = sum / BASE;
        }
        debug_assert_eq!(carry, 0, "integer part overflow");
    }

    /// `self -= other`. Requires `self >= other`.
    pub fn sub_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.limbs.len(), other.limbs.len());
        let mut borrow = 0i64;
        for (a, &b) in self.limbs.iter_mut().zip(&other.limbs).rev() {
            let mut diff = i64::from(*a) - i64::from(b) - borrow;
            if diff < 0 {
                diff += BASE as i64;
                borrow = 1;
            } else {
                borrow = 0;
            }
            *a = diff as u32;
        }
        debug_assert_eq!(borrow, 0, "fixed-point subtraction underflow");
    }

    /// Truncated product. Partial products below the last limb are dropped
    /// except for the first one, which supplies the carry; guard limbs absorb
    /// the resulting error.
    pub fn mul(&self, other: &Self) -> Self {
        debug_assert_eq!(self.limbs.len(), other.limbs.len());
        let n = self.limbs.len();
        let mut acc = vec![0u128; n + 1];
        for (i, &a) in self.limbs.iter().enumerate() {
            if a == 0 {
                continue;
            }
            let a = u128::from(a);
            for (j, &b) in other.limbs.iter().enumerate().take(n + 1 - i) {
                acc[i + j] += a * u128::from(b);
            }
        }

        let mut limbs = vec![0u32; n];
        let mut carry: u128 = 0;
        for k in (0..=n).rev() {
            let cur = acc[k] + carry;
            carry = cur / u128::from(BASE);
            if k < n {
                limbs[k] = (cur % u128::from(BASE)) as u32;
            }
        }
        debug_assert_eq!(carry, 0, "integer part overflow");
        Self { limbs }
    }

    /// Decimal representation truncated to `digits` places, e.g. `"3.1415"`.
    pub fn to_decimal_string(&self, digits: usize) -> String {
        let mut frac = String::with_capacity(self.frac_limbs() * LIMB_DIGITS);
        for limb in &self.limbs[1..] {
            frac.push_str(&format!("{limb:09}"));
            if frac.len() >= digits {
                break;
            }
        }
        frac.truncate(digits);
        if frac.is_empty() {
            self.limbs[0].to_string()
        } else {
            format!("{}.{}", self.limbs[0], frac)
        }
    }
}
