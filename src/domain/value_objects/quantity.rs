use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stock quantity as reported by Tally (`"100 Nos"`, `"-4.5 Kgs"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Quantity(BigDecimal);

impl Quantity {
    pub fn zero() -> Self {
        Quantity(BigDecimal::zero())
    }

    pub fn new(value: BigDecimal) -> Self {
        Quantity(value)
    }

    /// Take the leading signed number of the field, ignoring any unit suffix.
    /// Missing or non-numeric values degrade to zero.
    pub fn parse_lenient(raw: &str) -> Self {
        let trimmed = raw.trim();
        let mut end = 0;
        let mut seen_digit = false;
        let mut seen_dot = false;
        for (i, c) in trimmed.char_indices() {
            match c {
                '-' if i == 0 => {}
                '0'..='9' => seen_digit = true,
                '.' if !seen_dot => seen_dot = true,
                ',' => {}
                _ => break,
            }
            end = i + c.len_utf8();
        }
        if !seen_digit {
            return Quantity::zero();
        }
        let numeric: String = trimmed[..end].chars().filter(|c| *c != ',').collect();
        let numeric = numeric.trim_end_matches('.');
        BigDecimal::from_str(numeric)
            .map(Quantity)
            .unwrap_or_else(|_| Quantity::zero())
    }

    pub fn value(&self) -> &BigDecimal {
        &self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigDecimal::zero()
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }
}

impl From<i64> for Quantity {
    fn from(value: i64) -> Self {
        Quantity(BigDecimal::from(value))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0.with_scale(0);
        if whole == self.0 {
            write!(f, "{}", whole)
        } else {
            write!(f, "{}", self.0.normalized())
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
