//! Resource quantities
//!
//! Quantities are kept exact in milli-units so that `"500m"`, `"0.5"` and
//! `"1"` compare and add without floating point drift.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DevshareError;

/// Exact resource quantity stored in milli-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "String")]
pub struct Quantity {
    milli: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Int(i64),
    Str(String),
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = DevshareError;

    fn try_from(repr: QuantityRepr) -> Result<Self, Self::Error> {
        match repr {
            QuantityRepr::Int(v) => Quantity::checked_from_units(v)
                .ok_or_else(|| DevshareError::InvalidQuantity(format!("{} overflows", v))),
            QuantityRepr::Str(s) => s.parse(),
        }
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

impl Quantity {
    /// Zero quantity
    pub const ZERO: Quantity = Quantity { milli: 0 };

    /// Quantity of whole units
    pub fn from_units(units: i64) -> Self {
        Self {
            milli: units.saturating_mul(1000),
        }
    }

    fn checked_from_units(units: i64) -> Option<Self> {
        units.checked_mul(1000).map(|milli| Self { milli })
    }

    /// Quantity of milli-units
    pub fn from_milli(milli: i64) -> Self {
        Self { milli }
    }

    /// Value in milli-units
    pub fn milli_value(&self) -> i64 {
        self.milli
    }

    /// Value in whole units, rounded up
    pub fn value(&self) -> i64 {
        self.milli.div_euclid(1000) + i64::from(self.milli.rem_euclid(1000) != 0)
    }

    /// Whether the quantity has no fractional part
    pub fn is_integer(&self) -> bool {
        self.milli % 1000 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.milli < 0
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity {
            milli: self.milli.saturating_add(other.milli),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.milli / 1000)
        } else {
            write!(f, "{}m", self.milli)
        }
    }
}

fn suffix_multiplier(suffix: &str) -> Option<(i128, i128)> {
    // (numerator, denominator) applied to the parsed number
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        _ => return exponent_multiplier(suffix),
    };
    Some(m)
}

/// Decimal exponent form such as `1e3` or `5E-1`
fn exponent_multiplier(suffix: &str) -> Option<(i128, i128)> {
    let exponent: i32 = suffix
        .strip_prefix(|c: char| c == 'e' || c == 'E')
        .filter(|rest| !rest.is_empty())?
        .parse()
        .ok()?;
    if exponent.unsigned_abs() > MAX_EXPONENT {
        return None;
    }
    let scale = 10i128.pow(exponent.unsigned_abs());
    if exponent >= 0 {
        Some((scale, 1))
    } else {
        Some((1, scale))
    }
}

// beyond this no non-zero quantity fits in milli-units
const MAX_EXPONENT: u32 = 18;

impl FromStr for Quantity {
    type Err = DevshareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DevshareError::InvalidQuantity(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        let (num, den) = suffix_multiplier(suffix).ok_or_else(invalid)?;

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || frac_part.len() > 9
        {
            return Err(invalid());
        }

        // Work in nano-units of the unsuffixed number to stay exact
        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut frac_value: i128 = 0;
        if !frac_part.is_empty() {
            frac_value = frac_part.parse().map_err(|_| invalid())?;
            frac_value *= 10i128.pow(9 - frac_part.len() as u32);
        }
        let nanos = int_value
            .checked_mul(1_000_000_000)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(invalid)?;

        // nanos * num / den gives nano-units; milli = that / 1e6, rounded up
        let scaled = nanos.checked_mul(num).ok_or_else(invalid)?;
        let divisor = den * 1_000_000;
        let mut milli = scaled / divisor;
        if scaled % divisor != 0 {
            milli += 1;
        }
        if negative {
            milli = -milli;
        }
        let milli = i64::try_from(milli).map_err(|_| invalid())?;
        Ok(Quantity { milli })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_decimal() {
        assert_eq!("1".parse::<Quantity>().unwrap(), Quantity::from_units(1));
        assert_eq!("0.5".parse::<Quantity>().unwrap(), Quantity::from_milli(500));
        assert_eq!("500m".parse::<Quantity>().unwrap(), Quantity::from_milli(500));
        assert_eq!("-2".parse::<Quantity>().unwrap(), Quantity::from_units(-2));
    }

    #[test]
    fn test_parse_suffixes() {
        let q: Quantity = "16Gi".parse().unwrap();
        assert_eq!(q.value(), 16 * 1024 * 1024 * 1024);
        let q: Quantity = "2k".parse().unwrap();
        assert_eq!(q.value(), 2000);
    }

    #[test]
    fn test_parse_decimal_exponent() {
        assert_eq!("1e3".parse::<Quantity>().unwrap(), Quantity::from_units(1000));
        assert_eq!("1E3".parse::<Quantity>().unwrap(), Quantity::from_units(1000));
        assert_eq!("2.5e+2".parse::<Quantity>().unwrap(), Quantity::from_units(250));
        assert_eq!("5e-1".parse::<Quantity>().unwrap(), Quantity::from_milli(500));
        assert_eq!("-1e2".parse::<Quantity>().unwrap(), Quantity::from_units(-100));
        // sub-milli values round up like other suffixes
        assert_eq!("1e-6".parse::<Quantity>().unwrap(), Quantity::from_milli(1));

        assert!("1e".parse::<Quantity>().is_err());
        assert!("1e3.5".parse::<Quantity>().is_err());
        assert!("1ee3".parse::<Quantity>().is_err());
        assert!("1e30".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!("1.2.3".parse::<Quantity>().is_err());
        assert!("5Xi".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_integer_and_value() {
        let half = Quantity::from_milli(500);
        assert!(!half.is_integer());
        assert_eq!(half.value(), 1);
        assert!(Quantity::from_units(3).is_integer());
        assert_eq!(Quantity::from_units(3).value(), 3);
    }

    #[test]
    fn test_serde_accepts_int_and_string() {
        let a: Quantity = serde_json::from_str("4").unwrap();
        let b: Quantity = serde_json::from_str("\"4\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&Quantity::from_milli(250)).unwrap(), "\"250m\"");
    }
}
