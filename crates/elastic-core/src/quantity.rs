//! Resource quantities.
//!
//! Pod resources arrive as an integer, a plain decimal, or a quantity
//! string such as `"500m"`, `"4Gi"`, `"1.5"` or `"2e3"`. They are parsed
//! once, at normalization, into a [`Quantity`] holding an exact count of
//! milli-units. Sub-milli remainders round up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// `<digits>[.<digits>][suffix]` where suffix is binary, SI, or an exponent.
static QUANTITY_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<int>[0-9]*)(?:\.(?P<frac>[0-9]*))?(?P<suffix>Ki|Mi|Gi|Ti|Pi|Ei|[numkMGTPE]|[eE][+-]?[0-9]+)?$",
    )
});

/// Largest accepted decimal exponent, in either direction.
const MAX_EXPONENT: i32 = 30;

/// Errors produced while parsing a resource quantity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("malformed quantity '{0}'")]
    Syntax(String),

    #[error("negative quantity '{0}'")]
    Negative(String),

    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),

    #[error("quantity pattern failed to compile: {0}")]
    Pattern(String),
}

/// A single resource that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource '{resource}': {source}")]
pub struct ResourceError {
    pub resource: String,
    #[source]
    pub source: QuantityError,
}

/// An exact, non-negative resource amount in milli-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    millis: i128,
}

impl Quantity {
    /// A quantity of `units` whole units.
    pub fn from_units(units: u64) -> Self {
        Self {
            millis: i128::from(units) * 1000,
        }
    }

    /// The exact amount in milli-units.
    pub fn millis(&self) -> i128 {
        self.millis
    }

    /// The amount in whole units, rounded up.
    pub fn units_ceil(&self) -> i128 {
        (self.millis + 999) / 1000
    }
}

/// Multiplier implied by a quantity suffix.
enum Scale {
    /// Power of 1024.
    Binary(u32),
    /// Power of ten.
    Decimal(i32),
}

fn suffix_scale(suffix: &str, input: &str) -> Result<Scale, QuantityError> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "Ki" => Scale::Binary(1),
        "Mi" => Scale::Binary(2),
        "Gi" => Scale::Binary(3),
        "Ti" => Scale::Binary(4),
        "Pi" => Scale::Binary(5),
        "Ei" => Scale::Binary(6),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        exp => {
            let power: i32 = exp[1..]
                .parse()
                .map_err(|_| QuantityError::Syntax(input.to_string()))?;
            if power.abs() > MAX_EXPONENT {
                return Err(QuantityError::OutOfRange(input.to_string()));
            }
            Scale::Decimal(power)
        }
    };
    Ok(scale)
}

fn pow10(power: u32, input: &str) -> Result<i128, QuantityError> {
    10i128
        .checked_pow(power)
        .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(QuantityError::Empty);
        }
        if input.starts_with('-') {
            return Err(QuantityError::Negative(input.to_string()));
        }
        let unsigned = input.strip_prefix('+').unwrap_or(input);

        let re = QUANTITY_RE
            .as_ref()
            .map_err(|e| QuantityError::Pattern(e.to_string()))?;
        let caps = re
            .captures(unsigned)
            .ok_or_else(|| QuantityError::Syntax(input.to_string()))?;

        let int = caps.name("int").map_or("", |m| m.as_str());
        let frac = caps.name("frac").map_or("", |m| m.as_str());
        if int.is_empty() && frac.is_empty() {
            return Err(QuantityError::Syntax(input.to_string()));
        }

        // Trailing fractional zeros carry no value.
        let frac = frac.trim_end_matches('0');
        let digits = format!("{int}{frac}");
        let significant = digits.trim_start_matches('0');
        if significant.len() > 30 {
            return Err(QuantityError::OutOfRange(input.to_string()));
        }
        let mantissa: i128 = if significant.is_empty() {
            0
        } else {
            significant
                .parse()
                .map_err(|_| QuantityError::Syntax(input.to_string()))?
        };

        let overflow = || QuantityError::OutOfRange(input.to_string());
        let suffix = caps.name("suffix").map_or("", |m| m.as_str());
        // value = mantissa * 1024^binary * 10^exponent, in milli-units.
        let (binary, decimal) = match suffix_scale(suffix, input)? {
            Scale::Binary(power) => (power, 0),
            Scale::Decimal(power) => (0, power),
        };
        let frac_len = i32::try_from(frac.len()).map_err(|_| overflow())?;
        let exponent = decimal + 3 - frac_len;

        let factor = 1024i128.checked_pow(binary).ok_or_else(overflow)?;
        let mut numerator = mantissa.checked_mul(factor).ok_or_else(overflow)?;
        if exponent >= 0 {
            numerator = numerator
                .checked_mul(pow10(exponent.unsigned_abs(), input)?)
                .ok_or_else(overflow)?;
            return Ok(Self { millis: numerator });
        }

        // Round up: a request for 0.1m still needs one milli-unit. A divisor
        // beyond i128 exceeds any numerator, leaving at most one milli-unit.
        let millis = match 10i128.checked_pow(exponent.unsigned_abs()) {
            Some(denominator) => {
                numerator / denominator + i128::from(numerator % denominator != 0)
            }
            None => i128::from(numerator != 0),
        };
        Ok(Self { millis })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}", self.millis / 1000)
        } else {
            write!(f, "{}m", self.millis)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        QuantityValue::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// A quantity as written on the wire: integer, decimal, or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuantityValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl QuantityValue {
    /// Parse into the exact representation.
    pub fn parse(&self) -> Result<Quantity, QuantityError> {
        match self {
            Self::Integer(v) if *v < 0 => Err(QuantityError::Negative(v.to_string())),
            Self::Integer(v) => Ok(Quantity::from_units(v.unsigned_abs())),
            Self::Decimal(v) if !v.is_finite() => Err(QuantityError::Syntax(v.to_string())),
            Self::Decimal(v) if *v < 0.0 => Err(QuantityError::Negative(v.to_string())),
            Self::Decimal(v) => v.to_string().parse(),
            Self::Text(s) => s.parse(),
        }
    }
}

impl From<&str> for QuantityValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for QuantityValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<Quantity> for QuantityValue {
    fn from(q: Quantity) -> Self {
        Self::Text(q.to_string())
    }
}

/// Parse every entry of a resource map, reporting the first bad one.
pub fn parse_resources(
    raw: &BTreeMap<String, QuantityValue>,
) -> Result<BTreeMap<String, Quantity>, ResourceError> {
    raw.iter()
        .map(|(name, value)| {
            value
                .parse()
                .map(|q| (name.clone(), q))
                .map_err(|source| ResourceError {
                    resource: name.clone(),
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn plain_integers_and_decimals() {
        assert_eq!(q("2").millis(), 2000);
        assert_eq!(q("0.5").millis(), 500);
        assert_eq!(q("1.").millis(), 1000);
        assert_eq!(q(".25").millis(), 250);
        assert_eq!(q("+3").millis(), 3000);
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(q("1Ki").millis(), 1024 * 1000);
        assert_eq!(q("4Gi").units_ceil(), 4 * 1024 * 1024 * 1024);
        assert_eq!(q("1.5Mi").units_ceil(), 1536 * 1024);
    }

    #[test]
    fn si_suffixes() {
        assert_eq!(q("500m").millis(), 500);
        assert_eq!(q("2k").millis(), 2_000_000);
        assert_eq!(q("1M").units_ceil(), 1_000_000);
        assert_eq!(q("1E").units_ceil(), 10i128.pow(18));
    }

    #[test]
    fn exponent_suffixes() {
        assert_eq!(q("2e3").units_ceil(), 2000);
        assert_eq!(q("1E6").units_ceil(), 1_000_000);
        assert_eq!(q("5e-1").millis(), 500);
    }

    #[test]
    fn sub_milli_rounds_up() {
        assert_eq!(q("1n").millis(), 1);
        assert_eq!(q("0.0001").millis(), 1);
        assert_eq!(q("0").millis(), 0);
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "abc", "1.2.3", "1e", "1Ki5", "--1", "1 Gi", ".", "Gi"] {
            assert!(bad.parse::<Quantity>().is_err(), "accepted '{bad}'");
        }
        assert_eq!(
            "-1".parse::<Quantity>(),
            Err(QuantityError::Negative("-1".to_string()))
        );
        assert!(matches!(
            "1e99".parse::<Quantity>(),
            Err(QuantityError::OutOfRange(_))
        ));
    }

    #[test]
    fn values_near_the_limit_stay_exact() {
        assert_eq!(
            q("170141183460469231731.687303715M").millis(),
            170_141_183_460_469_231_731_687_303_715
        );
        assert_eq!(
            "999999999999999999999999999999E".parse::<Quantity>(),
            Err(QuantityError::OutOfRange("999999999999999999999999999999E".to_string()))
        );
        assert!(matches!(
            "170141183460469231731687303715Ei".parse::<Quantity>(),
            Err(QuantityError::OutOfRange(_))
        ));
    }

    #[test]
    fn long_fractions_are_accepted() {
        assert_eq!(q("1.0000000000000000000000000000000").millis(), 1000);
        assert_eq!(q("2.50000000000000000000000000000000000000000Gi"), q("2560Mi"));
        let tiny = format!("0.{}1", "0".repeat(60));
        assert_eq!(q(&tiny).millis(), 1);
        assert_eq!(q("0.000000000000000000000000000000000000000000").millis(), 0);
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("1.5").to_string(), "1500m");
        assert_eq!(q("1Ki").to_string(), "1024");
        assert_eq!(q("1500m"), q("1.5"));
    }

    #[test]
    fn wire_values_parse() {
        let int: QuantityValue = serde_json::from_str("4").unwrap();
        let dec: QuantityValue = serde_json::from_str("0.5").unwrap();
        let text: QuantityValue = serde_json::from_str("\"2Gi\"").unwrap();
        assert_eq!(int, QuantityValue::Integer(4));
        assert_eq!(int.parse().unwrap(), q("4"));
        assert_eq!(dec.parse().unwrap(), q("500m"));
        assert_eq!(text.parse().unwrap(), q("2Gi"));
        assert!(QuantityValue::Integer(-2).parse().is_err());
    }

    #[test]
    fn parse_resources_names_the_bad_entry() {
        let mut raw = BTreeMap::new();
        raw.insert("cpu".to_string(), QuantityValue::from("2"));
        raw.insert("memory".to_string(), QuantityValue::from("lots"));
        let err = parse_resources(&raw).unwrap_err();
        assert_eq!(err.resource, "memory");
    }

    #[test]
    fn serde_uses_canonical_string() {
        let json = serde_json::to_string(&q("250m")).unwrap();
        assert_eq!(json, "\"250m\"");
        let back: Quantity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.millis(), 250);
    }
}
