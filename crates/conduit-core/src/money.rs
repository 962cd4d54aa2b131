//! Fixed-point money and price multipliers
//!
//! Amounts are whole micro-dollars so ledger arithmetic is exact and every
//! stored value carries the same six decimal places. Multipliers use the same
//! scale (millionths).

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

const SCALE: i64 = 1_000_000;

/// An amount of US dollars in millionths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsdMicros(i64);

impl UsdMicros {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Convert a dollar amount, rounding to the nearest micro-dollar
    ///
    /// Non-finite inputs map to zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_usd(usd: f64) -> Self {
        if !usd.is_finite() {
            return Self::ZERO;
        }
        let scaled = (usd * 1_000_000.0).round();
        if scaled >= i64::MAX as f64 {
            Self(i64::MAX)
        } else if scaled <= i64::MIN as f64 {
            Self(i64::MIN)
        } else {
            Self(scaled as i64)
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_usd(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Clamp negatives to zero
    #[must_use]
    pub const fn non_negative(self) -> Self {
        if self.0 < 0 { Self::ZERO } else { self }
    }

    /// Cost of `tokens` at a per-million-token price, truncated to whole micros
    #[allow(clippy::cast_possible_truncation)]
    pub fn per_million(tokens: i64, price_per_million: Self) -> Self {
        if tokens <= 0 || price_per_million.0 <= 0 {
            return Self::ZERO;
        }
        let raw = i128::from(tokens) * i128::from(price_per_million.0) / i128::from(SCALE);
        Self(raw.min(i128::from(i64::MAX)) as i64)
    }
}

impl fmt::Display for UsdMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE.unsigned_abs();
        write!(f, "{sign}${}.{:06}", abs / scale, abs % scale)
    }
}

impl Add for UsdMicros {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign for UsdMicros {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for UsdMicros {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for UsdMicros {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Sum for UsdMicros {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

/// A price multiplier in millionths
///
/// Zero, negative and non-finite inputs normalize to `1`, so a misconfigured
/// group never bills for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Multiplier(i64);

impl Multiplier {
    pub const ONE: Self = Self(SCALE);

    pub const fn from_millionths(raw: i64) -> Self {
        if raw <= 0 { Self::ONE } else { Self(raw) }
    }

    pub const fn millionths(self) -> i64 {
        self.0
    }

    /// Truncates to six decimal places
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return Self::ONE;
        }
        let scaled = (value * 1_000_000.0).trunc();
        if scaled >= i64::MAX as f64 {
            return Self(i64::MAX);
        }
        Self::from_millionths(scaled as i64)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Scale an amount, truncating toward zero
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(self, amount: UsdMicros) -> UsdMicros {
        if self == Self::ONE || amount.is_zero() {
            return amount;
        }
        let raw = i128::from(amount.micros()) * i128::from(self.0) / i128::from(SCALE);
        UsdMicros::from_micros(raw.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    /// Combine two multipliers
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn then(self, other: Self) -> Self {
        let raw = i128::from(self.0) * i128::from(other.0) / i128::from(SCALE);
        Self::from_millionths(raw.min(i128::from(i64::MAX)) as i64)
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl From<f64> for Multiplier {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<Multiplier> for f64 {
    fn from(value: Multiplier) -> Self {
        value.as_f64()
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / SCALE;
        let frac = self.0 % SCALE;
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            let digits = format!("{frac:06}");
            write!(f, "{whole}.{}", digits.trim_end_matches('0'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_six_places() {
        assert_eq!(UsdMicros::from_micros(1_000).to_string(), "$0.001000");
        assert_eq!(UsdMicros::from_micros(-30_000_000).to_string(), "-$30.000000");
    }

    #[test]
    fn from_usd_rounds_to_micro() {
        assert_eq!(UsdMicros::from_usd(0.001).micros(), 1_000);
        assert_eq!(UsdMicros::from_usd(0.0005).micros(), 500);
        assert_eq!(UsdMicros::from_usd(f64::NAN), UsdMicros::ZERO);
    }

    #[test]
    fn per_million_truncates() {
        // $10 per 1M tokens
        let price = UsdMicros::from_usd(10.0);
        assert_eq!(UsdMicros::per_million(1_000_000, price), UsdMicros::from_usd(10.0));
        // 1 token at $10/1M is 10 micros
        assert_eq!(UsdMicros::per_million(1, price).micros(), 10);
        // 1 token at $0.5/1M truncates to zero
        assert_eq!(UsdMicros::per_million(1, UsdMicros::from_usd(0.5)), UsdMicros::ZERO);
    }

    #[test]
    fn multiplier_normalizes_non_positive() {
        assert_eq!(Multiplier::from_f64(0.0), Multiplier::ONE);
        assert_eq!(Multiplier::from_f64(-2.0), Multiplier::ONE);
        assert_eq!(Multiplier::from_f64(f64::INFINITY), Multiplier::ONE);
        assert_eq!(Multiplier::from_f64(1.5).millionths(), 1_500_000);
    }

    #[test]
    fn multipliers_stack() {
        let base = UsdMicros::from_usd(10.0);
        let combined = Multiplier::from_f64(2.0).then(Multiplier::from_f64(1.5));
        assert_eq!(combined.apply(base), UsdMicros::from_usd(30.0));
    }

    #[test]
    fn multiplier_display() {
        assert_eq!(Multiplier::from_f64(1.5).to_string(), "1.5");
        assert_eq!(Multiplier::ONE.to_string(), "1");
    }

    #[test]
    fn multiplier_deserializes_from_float() {
        let m: Multiplier = serde_json::from_str("2.25").unwrap();
        assert_eq!(m.millionths(), 2_250_000);
    }
}
