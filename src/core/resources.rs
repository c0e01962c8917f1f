//! Typed arithmetic over named resource quantities.
//!
//! Quantities are fixed-point milli-units so that `"500m"` cpu and `"1.5Gi"`
//! memory are both exact. Subtraction is never clamped: a negative result is
//! how over-commitment of a cluster is signalled to callers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Fixed-point quantity stored in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    /// Zero quantity.
    pub const ZERO: Self = Self(0);

    /// Quantity from whole units.
    pub const fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(1000))
    }

    /// Quantity from milli-units.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Raw milli-unit value.
    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Approximate value in whole units.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// True when strictly below zero.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    fn suffix_multiplier(suffix: &str) -> Option<i128> {
        let m = match suffix {
            "" => 1_000,
            "m" => 1,
            "k" => 1_000_000,
            "M" => 1_000_000_000,
            "G" => 1_000_000_000_000,
            "T" => 1_000_000_000_000_000,
            "Ki" => 1_024 * 1_000,
            "Mi" => 1_024 * 1_024 * 1_000,
            "Gi" => 1_024 * 1_024 * 1_024 * 1_000,
            "Ti" => 1_024 * 1_024 * 1_024 * 1_024 * 1_000,
            _ => return None,
        };
        Some(m)
    }
}

impl FromStr for Quantity {
    type Err = SchedulerError;

    /// Parse Kubernetes-style quantity strings such as `"2"`, `"250m"`, `"1.5Gi"`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| SchedulerError::invalid("quantity", format!("`{input}`: {why}"));
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        let multiplier = Self::suffix_multiplier(suffix).ok_or_else(|| bad("unknown suffix"))?;

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(bad("missing number"));
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) || frac.len() > 9 {
            return Err(bad("malformed number"));
        }

        let mantissa: i128 = format!("{whole}{frac}")
            .parse()
            .map_err(|_| bad("number out of range"))?;
        let scale = 10_i128.pow(u32::try_from(frac.len()).unwrap_or(0));
        // round up like kubernetes does when precision is lost
        let scaled = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| bad("number out of range"))?;
        let millis = (scaled + scale - 1) / scale;
        let millis = if negative { -millis } else { millis };
        i64::try_from(millis)
            .map(Self)
            .map_err(|_| bad("number out of range"))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Add for Quantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Quantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Quantity {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

/// Mapping from resource name (`cpu`, `memory`, `nvidia.com/gpu`, ...) to quantity.
///
/// Absent names read as zero. Values are plain data: callers that need to keep
/// an input unchanged use [`ComputeResources::plus`]/[`ComputeResources::minus`]
/// or clone before calling the in-place [`ComputeResources::add`]/[`ComputeResources::sub`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComputeResources(BTreeMap<String, Quantity>);

impl ComputeResources {
    /// Empty resource set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from whole-unit pairs, e.g. `[("cpu", 4), ("memory", 1024)]`.
    pub fn from_units<'a>(pairs: impl IntoIterator<Item = (&'a str, i64)>) -> Self {
        pairs
            .into_iter()
            .map(|(name, units)| (name.to_string(), Quantity::from_units(units)))
            .collect()
    }

    /// Build from quantity strings, e.g. `[("cpu", "500m"), ("memory", "1Gi")]`.
    pub fn parse<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, SchedulerError> {
        pairs
            .into_iter()
            .map(|(name, raw)| Ok((name.to_string(), raw.parse::<Quantity>()?)))
            .collect()
    }

    /// Quantity of one resource, zero when absent.
    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    /// Set one resource quantity.
    pub fn set(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    /// Iterate over `(name, quantity)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True when no resource is named.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds `other` into `self` in place.
    pub fn add(&mut self, other: &Self) {
        for (name, quantity) in &other.0 {
            let slot = self.0.entry(name.clone()).or_default();
            *slot = *slot + *quantity;
        }
    }

    /// Subtracts `other` from `self` in place. Results may go negative.
    pub fn sub(&mut self, other: &Self) {
        for (name, quantity) in &other.0 {
            let slot = self.0.entry(name.clone()).or_default();
            *slot = *slot - *quantity;
        }
    }

    /// New value equal to `self + other`.
    #[must_use]
    pub fn plus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.add(other);
        out
    }

    /// New value equal to `self - other`, unclamped.
    #[must_use]
    pub fn minus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.sub(other);
        out
    }

    /// Sum of many resource sets.
    pub fn total<'a>(items: impl IntoIterator<Item = &'a Self>) -> Self {
        items.into_iter().fold(Self::new(), |mut acc, r| {
            acc.add(r);
            acc
        })
    }

    /// Whether every quantity requested by `self` is available in `available`.
    pub fn fits_within(&self, available: &Self) -> bool {
        self.0
            .iter()
            .all(|(name, quantity)| *quantity <= available.get(name))
    }

    /// True when any resource is over-committed.
    pub fn is_negative_anywhere(&self) -> bool {
        self.0.values().any(|q| q.is_negative())
    }

    /// Collapse to one number, weighting each resource by its scarcity.
    /// Resources without a scarcity entry do not contribute.
    pub fn scalar(&self, scarcity: &HashMap<String, f64>) -> f64 {
        self.0
            .iter()
            .filter_map(|(name, q)| scarcity.get(name).map(|w| w * q.as_f64()))
            .sum()
    }
}

impl FromIterator<(String, Quantity)> for ComputeResources {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (name, quantity) in iter {
            let slot = out.0.entry(name).or_default();
            *slot = *slot + quantity;
        }
        out
    }
}

impl fmt::Display for ComputeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, q)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {q}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantities() {
        assert_eq!("2".parse::<Quantity>().unwrap(), Quantity::from_units(2));
        assert_eq!("250m".parse::<Quantity>().unwrap(), Quantity::from_millis(250));
        assert_eq!("0.5".parse::<Quantity>().unwrap(), Quantity::from_millis(500));
        assert_eq!(
            "1Ki".parse::<Quantity>().unwrap(),
            Quantity::from_units(1024)
        );
        assert_eq!(
            "1.5Gi".parse::<Quantity>().unwrap(),
            Quantity::from_units(1_610_612_736)
        );
        assert_eq!("2k".parse::<Quantity>().unwrap(), Quantity::from_units(2000));
        assert_eq!("-1".parse::<Quantity>().unwrap(), Quantity::from_units(-1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
        assert!("1Xi".parse::<Quantity>().is_err());
        assert!("1.2.3".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_subtraction_is_not_clamped() {
        let capacity = ComputeResources::from_units([("cpu", 2)]);
        let used = ComputeResources::from_units([("cpu", 5), ("memory", 1)]);
        let left = capacity.minus(&used);
        assert_eq!(left.get("cpu"), Quantity::from_units(-3));
        assert_eq!(left.get("memory"), Quantity::from_units(-1));
        assert!(left.is_negative_anywhere());
        // inputs untouched
        assert_eq!(capacity.get("cpu"), Quantity::from_units(2));
    }

    #[test]
    fn test_fits_within() {
        let available = ComputeResources::from_units([("cpu", 4), ("memory", 8)]);
        assert!(ComputeResources::from_units([("cpu", 4)]).fits_within(&available));
        assert!(!ComputeResources::from_units([("cpu", 5)]).fits_within(&available));
        assert!(!ComputeResources::from_units([("gpu", 1)]).fits_within(&available));
        assert!(ComputeResources::new().fits_within(&available));
    }

    #[test]
    fn test_scalar_uses_scarcity() {
        let scarcity = HashMap::from([("cpu".to_string(), 1.0), ("gpu".to_string(), 10.0)]);
        let r = ComputeResources::from_units([("cpu", 3), ("gpu", 1), ("memory", 100)]);
        assert!((r.scalar(&scarcity) - 13.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display() {
        let r = ComputeResources::parse([("cpu", "1500m"), ("memory", "2")]).unwrap();
        assert_eq!(r.to_string(), "{cpu: 1500m, memory: 2}");
    }
}
