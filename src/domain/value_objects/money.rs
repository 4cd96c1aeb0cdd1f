use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

/// Exact currency amount.
///
/// Sums are carried in `BigDecimal` so that totals over thousands of vouchers
/// never drift. Serialized as a string with two decimals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(BigDecimal);

impl Money {
    pub fn zero() -> Self {
        Money(BigDecimal::zero())
    }

    pub fn new(value: BigDecimal) -> Self {
        Money(value)
    }

    /// Parse an amount as Tally renders it (`"₹1,23,456.50"`, `"Rs. 500"`,
    /// `"-1200.00"`). Anything unparseable degrades to zero.
    pub fn parse_lenient(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(Money::zero)
    }

    /// Strict variant of [`Money::parse_lenient`]
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .replace('₹', "")
            .replace("Rs.", "")
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        BigDecimal::from_str(&cleaned).ok().map(Money)
    }

    pub fn value(&self) -> &BigDecimal {
        &self.0
    }

    pub fn abs(&self) -> Money {
        Money(self.0.abs())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigDecimal::zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigDecimal::zero()
    }

    /// Average over `count` items, zero when there are none
    pub fn average(&self, count: usize) -> Money {
        if count == 0 {
            return Money::zero();
        }
        Money(&self.0 / BigDecimal::from(count as u64))
    }

    /// Lossy conversion for statistics (ratios, regression input)
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Two-decimal rendering used on the wire
    pub fn to_rounded_string(&self) -> String {
        self.0.round(2).with_scale(2).to_string()
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money(BigDecimal::from(value))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rounded_string())
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Money> for Money {
    type Output = Money;

    fn add(self, rhs: &'a Money) -> Money {
        Money(self.0 + &rhs.0)
    }
}

impl AddAssign<&Money> for Money {
    fn add_assign(&mut self, rhs: &Money) {
        self.0 += &rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rounded_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", raw)))
    }
}
