use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{ByteReader, ByteWriter};
use crate::errors::{ChainError, ChainResult};

/// Fixed denominator of the fractional part.
pub const FRACTION_DENOMINATOR: u64 = 1_000_000_000_000_000_000;

/// Fixed-point currency amount: signed integral part plus an unsigned
/// fraction scaled by 10^18. Ordering is lexicographic on
/// `(integral, fraction)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    integral: i32,
    fraction: u64,
}

impl Amount {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(integral: i32, fraction: u64) -> Self {
        let carry = fraction / FRACTION_DENOMINATOR;
        Self {
            integral: integral.saturating_add(carry as i32),
            fraction: fraction % FRACTION_DENOMINATOR,
        }
    }

    pub fn from_integral(integral: i32) -> Self {
        Self {
            integral,
            fraction: 0,
        }
    }

    pub fn integral(&self) -> i32 {
        self.integral
    }

    pub fn fraction(&self) -> u64 {
        self.fraction
    }

    pub fn is_negative(&self) -> bool {
        self.integral < 0
    }

    pub fn is_zero(&self) -> bool {
        self.integral == 0 && self.fraction == 0
    }

    pub fn to_f64(&self) -> f64 {
        self.integral as f64 + self.fraction as f64 / FRACTION_DENOMINATOR as f64
    }

    pub fn from_f64(value: f64) -> Self {
        let integral = value.floor();
        let fraction = ((value - integral) * FRACTION_DENOMINATOR as f64).round() as u64;
        Self::new(integral as i32, fraction)
    }

    pub fn checked_add(&self, other: &Amount) -> Option<Amount> {
        let fraction = self.fraction + other.fraction;
        let carry = (fraction / FRACTION_DENOMINATOR) as i32;
        let integral = self
            .integral
            .checked_add(other.integral)?
            .checked_add(carry)?;
        Some(Amount {
            integral,
            fraction: fraction % FRACTION_DENOMINATOR,
        })
    }

    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        let mut integral = self.integral.checked_sub(other.integral)?;
        let fraction = if self.fraction >= other.fraction {
            self.fraction - other.fraction
        } else {
            integral = integral.checked_sub(1)?;
            FRACTION_DENOMINATOR - (other.fraction - self.fraction)
        };
        Some(Amount { integral, fraction })
    }

    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_i32(self.integral);
        writer.put_u64(self.fraction);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let integral = reader.get_i32()?;
        let fraction = reader.get_u64()?;
        if fraction >= FRACTION_DENOMINATOR {
            return Err(ChainError::MalformedBinary(format!(
                "amount fraction {fraction} exceeds denominator"
            )));
        }
        Ok(Self { integral, fraction })
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.integral
            .cmp(&other.integral)
            .then(self.fraction.cmp(&other.fraction))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fraction == 0 {
            return write!(f, "{}", self.integral);
        }
        // The fraction is always positive; a negative value is carried as
        // `integral + fraction`, so -3.25 is stored as (-4, 0.75).
        if self.integral < 0 {
            let whole = -(self.integral as i64) - 1;
            let digits = format!("{:018}", FRACTION_DENOMINATOR - self.fraction);
            write!(f, "-{whole}.{}", digits.trim_end_matches('0'))
        } else {
            let digits = format!("{:018}", self.fraction);
            write!(f, "{}.{}", self.integral, digits.trim_end_matches('0'))
        }
    }
}

impl FromStr for Amount {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChainError::Config(format!("invalid amount literal: {s}"));
        match s.split_once('.') {
            None => {
                let integral: i32 = s.parse().map_err(|_| invalid())?;
                Ok(Amount::from_integral(integral))
            }
            Some((whole, frac)) => {
                if frac.is_empty() || frac.len() > 18 || !frac.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(invalid());
                }
                let integral: i32 = whole.parse().map_err(|_| invalid())?;
                let scale = 10u64.pow(18 - frac.len() as u32);
                let fraction: u64 = frac.parse::<u64>().map_err(|_| invalid())? * scale;
                if whole.starts_with('-') {
                    if fraction == 0 {
                        return Ok(Amount::from_integral(integral));
                    }
                    // The sign covers the fractional digits too.
                    return Ok(Amount {
                        integral: integral.checked_sub(1).ok_or_else(invalid)?,
                        fraction: FRACTION_DENOMINATOR - fraction,
                    });
                }
                Ok(Amount::new(integral, fraction))
            }
        }
    }
}

const COMMISSION_MANTISSA_MAX: u16 = 0x3ff;
const COMMISSION_EXPONENT_BIAS: i32 = 18;

/// 16-bit compressed-float fee: sign(1) | exponent(5, excess-18) |
/// mantissa(10). Value is `±(mantissa / 1024) · 10^(exponent - 18)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    raw: u16,
}

impl Commission {
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    pub fn to_f64(&self) -> f64 {
        let sign = if self.raw >> 15 == 1 { -1.0 } else { 1.0 };
        let exponent = ((self.raw >> 10) & 0x1f) as i32 - COMMISSION_EXPONENT_BIAS;
        let mantissa = (self.raw & COMMISSION_MANTISSA_MAX) as f64 / 1024.0;
        sign * mantissa * 10f64.powi(exponent)
    }

    pub fn from_f64(value: f64) -> Self {
        let sign: u16 = if value < 0.0 { 1 } else { 0 };
        let magnitude = value.abs();
        let mut best: (f64, u16) = (f64::MAX, 0);
        for exponent in 0u16..32 {
            let scale = 10f64.powi(exponent as i32 - COMMISSION_EXPONENT_BIAS);
            let mantissa = (magnitude / scale * 1024.0).round();
            if !(0.0..=COMMISSION_MANTISSA_MAX as f64).contains(&mantissa) {
                continue;
            }
            let encoded = mantissa / 1024.0 * scale;
            let error = (encoded - magnitude).abs();
            if error < best.0 {
                best = (error, (exponent << 10) | mantissa as u16);
            }
        }
        Self {
            raw: (sign << 15) | best.1,
        }
    }

    /// `true` when this fee covers at least `other`.
    pub fn covers(&self, other: &Commission) -> bool {
        self.to_f64() >= other.to_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        let small = Amount::new(1, 999_999_999_999_999_999);
        let large = Amount::new(2, 0);
        assert!(small < large);
        assert!(Amount::new(-1, 5) < Amount::zero());
    }

    #[test]
    fn add_carries_fraction_overflow() {
        let a = Amount::new(1, 600_000_000_000_000_000);
        let b = Amount::new(2, 700_000_000_000_000_000);
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.integral(), 4);
        assert_eq!(sum.fraction(), 300_000_000_000_000_000);
    }

    #[test]
    fn sub_borrows_from_integral() {
        let a = Amount::new(2, 100_000_000_000_000_000);
        let b = Amount::new(1, 400_000_000_000_000_000);
        let diff = a.checked_sub(&b).unwrap();
        assert_eq!(diff.integral(), 0);
        assert_eq!(diff.fraction(), 700_000_000_000_000_000);
    }

    #[test]
    fn codec_round_trip() {
        let amount = Amount::new(-3, 250_000_000_000_000_000);
        let mut writer = ByteWriter::new();
        amount.write_to(&mut writer);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 12);
        let decoded = Amount::read_from(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, amount);
    }

    #[test]
    fn parses_decimal_literals() {
        let amount: Amount = "12.5".parse().unwrap();
        assert_eq!(amount, Amount::new(12, 500_000_000_000_000_000));
        assert_eq!("7".parse::<Amount>().unwrap(), Amount::from_integral(7));
        assert!("1.2.3".parse::<Amount>().is_err());
    }

    #[test]
    fn negative_literals_round_trip_through_display() {
        let amount: Amount = "-3.25".parse().unwrap();
        assert_eq!(amount.integral(), -4);
        assert_eq!(amount.fraction(), 750_000_000_000_000_000);
        assert!((amount.to_f64() + 3.25).abs() < 1e-9);
        assert_eq!(amount.to_string(), "-3.25");
        assert_eq!("-3.25".parse::<Amount>().unwrap(), amount);
    }

    #[test]
    fn commission_encodes_close_values() {
        let fee = Commission::from_f64(0.1);
        assert!((fee.to_f64() - 0.1).abs() < 0.001);
        let max = Commission::from_f64(1.0);
        assert!(max.covers(&fee));
        assert!(!fee.covers(&max));
    }
}
