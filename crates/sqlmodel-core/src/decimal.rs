//! Exact fixed-point decimals.
//!
//! Numeric, decimal and money columns travel through the façade as
//! [`Decimal`]: an unscaled 128-bit integer plus a precision and a scale.
//! Thirty-eight digits fit in an `i128`, which is the widest numeric type the
//! supported servers define.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};

/// Largest supported precision.
pub const MAX_PRECISION: u8 = 38;

/// A fixed-point decimal: `unscaled * 10^-scale` with `precision` digits.
///
/// Two decimals are equal when their value, precision and scale are all
/// equal, so `1.0` at `(2, 1)` and `1.00` at `(3, 2)` compare unequal. Use
/// [`Decimal::cmp_value`] to compare numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Decimal {
    unscaled: i128,
    precision: u8,
    scale: u8,
}

impl Decimal {
    /// Build a decimal from its unscaled integer.
    ///
    /// Fails when `precision` is 0 or above 38, when `scale > precision`, or
    /// when `unscaled` needs more than `precision` digits.
    pub fn new(unscaled: i128, precision: u8, scale: u8) -> crate::Result<Self> {
        if precision == 0 || precision > MAX_PRECISION || scale > precision {
            return Err(decimal_error(format!(
                "invalid precision/scale ({precision}, {scale})"
            )));
        }
        if digit_count(unscaled) > u32::from(precision) {
            return Err(decimal_error(format!(
                "{unscaled} does not fit in precision {precision}"
            )));
        }
        Ok(Self {
            unscaled,
            precision,
            scale,
        })
    }

    /// Zero at precision 1, scale 0.
    pub const fn zero() -> Self {
        Self {
            unscaled: 0,
            precision: 1,
            scale: 0,
        }
    }

    pub const fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub const fn precision(&self) -> u8 {
        self.precision
    }

    pub const fn scale(&self) -> u8 {
        self.scale
    }

    pub const fn is_negative(&self) -> bool {
        self.unscaled < 0
    }

    /// Convert to another precision and scale.
    ///
    /// Reducing the scale rounds half away from zero. Fails when the result
    /// needs more digits than `precision`.
    pub fn rescale(&self, precision: u8, scale: u8) -> crate::Result<Self> {
        let unscaled = match scale.cmp(&self.scale) {
            Ordering::Equal => Some(self.unscaled),
            Ordering::Greater => pow10(scale - self.scale)
                .and_then(|factor| self.unscaled.checked_mul(factor)),
            Ordering::Less => pow10(self.scale - scale).map(|factor| {
                let quotient = self.unscaled / factor;
                let remainder = (self.unscaled % factor).abs();
                if remainder * 2 >= factor {
                    quotient + self.unscaled.signum()
                } else {
                    quotient
                }
            }),
        };
        let unscaled = unscaled.ok_or_else(|| {
            decimal_error(format!("{self} overflows precision {precision}"))
        })?;
        Self::new(unscaled, precision, scale)
            .map_err(|_| decimal_error(format!("{self} overflows ({precision}, {scale})")))
    }

    /// Numeric comparison ignoring precision and scale.
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        let lhs = pow10(scale - self.scale).and_then(|f| self.unscaled.checked_mul(f));
        let rhs = pow10(scale - other.scale).and_then(|f| other.unscaled.checked_mul(f));
        match (lhs, rhs) {
            (Some(a), Some(b)) => a.cmp(&b),
            // Only reachable with 38-digit values at very different scales.
            _ => self.to_f64().total_cmp(&other.to_f64()),
        }
    }

    /// Lossy conversion to a float.
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.unscaled.unsigned_abs().to_string();
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let scale = usize::from(self.scale);
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

impl FromStr for Decimal {
    type Err = Error;

    /// Parse `[+-]digits[.digits]`.
    ///
    /// The precision is the number of significant integer digits plus the
    /// scale (minimum 1); the scale is the number of fraction digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (negative, body) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        let valid = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !valid(int_part) || !valid(frac_part)
        {
            return Err(decimal_error(format!("'{s}' is not a decimal number")));
        }

        let int_digits = int_part.trim_start_matches('0');
        let scale = u8::try_from(frac_part.len())
            .ok()
            .filter(|scale| *scale <= MAX_PRECISION)
            .ok_or_else(|| decimal_error(format!("'{s}' has too many fraction digits")))?;
        let precision = u8::try_from(int_digits.len() + frac_part.len())
            .ok()
            .filter(|p| *p <= MAX_PRECISION)
            .ok_or_else(|| decimal_error(format!("'{s}' has more than 38 digits")))?
            .max(1);

        let mut unscaled: i128 = 0;
        for b in int_digits.bytes().chain(frac_part.bytes()) {
            unscaled = unscaled * 10 + i128::from(b - b'0');
        }
        if negative {
            unscaled = -unscaled;
        }
        Self::new(unscaled, precision, scale)
    }
}

impl TryFrom<String> for Decimal {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Decimal> for String {
    fn from(value: Decimal) -> Self {
        value.to_string()
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        let unscaled = i128::from(value);
        let precision = u8::try_from(digit_count(unscaled)).unwrap_or(MAX_PRECISION);
        Self {
            unscaled,
            precision,
            scale: 0,
        }
    }
}

fn pow10(exp: u8) -> Option<i128> {
    10i128.checked_pow(u32::from(exp))
}

fn digit_count(value: i128) -> u32 {
    let abs = value.unsigned_abs();
    if abs == 0 { 1 } else { abs.ilog10() + 1 }
}

fn decimal_error(actual: String) -> Error {
    Error::Type(TypeError {
        expected: "decimal",
        actual,
        column: None,
        rust_type: Some("Decimal"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let d: Decimal = "-214748.3648".parse().unwrap();
        assert_eq!(d.unscaled(), -2_147_483_648);
        assert_eq!(d.precision(), 10);
        assert_eq!(d.scale(), 4);
        assert_eq!(d.to_string(), "-214748.3648");

        let small: Decimal = "0.0001".parse().unwrap();
        assert_eq!(small.precision(), 4);
        assert_eq!(small.to_string(), "0.0001");

        assert_eq!("0".parse::<Decimal>().unwrap(), Decimal::zero());
        assert_eq!("+12".parse::<Decimal>().unwrap().to_string(), "12");
        assert_eq!(".5".parse::<Decimal>().unwrap().to_string(), "0.5");
    }

    #[test]
    fn parse_rejects_garbage() {
        for text in ["", "-", "1.2.3", "abc", "1e5", "."] {
            assert!(text.parse::<Decimal>().is_err(), "{text}");
        }
        let too_long = "1".repeat(39);
        assert!(too_long.parse::<Decimal>().is_err());
    }

    #[test]
    fn new_checks_precision() {
        assert!(Decimal::new(12345, 4, 0).is_err());
        assert!(Decimal::new(1, 2, 3).is_err());
        assert!(Decimal::new(0, 0, 0).is_err());
        assert!(Decimal::new(9999, 4, 2).is_ok());
    }

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        let d: Decimal = "1.23456".parse().unwrap();
        assert_eq!(d.rescale(10, 4).unwrap().to_string(), "1.2346");
        let n: Decimal = "-1.00005".parse().unwrap();
        assert_eq!(n.rescale(10, 4).unwrap().to_string(), "-1.0001");
        let up: Decimal = "12.5".parse().unwrap();
        assert_eq!(up.rescale(19, 4).unwrap().to_string(), "12.5000");
    }

    #[test]
    fn rescale_overflow_is_an_error() {
        let d: Decimal = "123456".parse().unwrap();
        assert!(d.rescale(6, 2).is_err());
    }

    #[test]
    fn equality_includes_scale() {
        let a: Decimal = "1.0".parse().unwrap();
        let b: Decimal = "1.00".parse().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.cmp_value(&b), Ordering::Equal);
    }

    #[test]
    fn serde_as_string() {
        let d: Decimal = "3.14".parse().unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"3.14\"");
        let back: Decimal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
