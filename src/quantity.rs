//! Canonical parsing and comparison of Kubernetes resource quantities.
//!
//! The Kubernetes API represents quantities as opaque strings (`100m`,
//! `150M`, `1Gi`). Scaling decisions need exact numeric comparison, so
//! quantities are parsed into a canonical nano-unit integer. Equality and
//! ordering compare the canonical value; `Display` preserves the original
//! string so patches round-trip what the user wrote.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use std::cmp::Ordering;
use std::fmt;

/// A parsed resource quantity with canonical nano-unit value.
#[derive(Debug, Clone)]
pub struct ResourceQuantity {
    raw: String,
    nanos: i128,
}

impl ResourceQuantity {
    /// Parses a Kubernetes quantity string.
    ///
    /// Supports plain integers and decimals, decimal SI suffixes
    /// (`n`, `u`, `m`, `k`, `M`, `G`, `T`, `P`, `E`), binary suffixes
    /// (`Ki` through `Ei`) and scientific notation (`1e3`). Values finer
    /// than one nano-unit are rounded up, matching apimachinery.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Configuration("quantity string is empty".to_string()));
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (mantissa, suffix) = trimmed.split_at(split);
        if mantissa.is_empty() {
            return Err(Error::Configuration(format!(
                "quantity '{}' has no numeric part",
                trimmed
            )));
        }

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(Error::Configuration(format!(
                "quantity '{}' has no digits",
                trimmed
            )));
        }

        let multiplier = Self::suffix_multiplier(suffix, trimmed)?;

        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| {
                Error::Configuration(format!("quantity '{}' is not a number", trimmed))
            })?
        };

        let mut nanos = int_value.checked_mul(multiplier).ok_or_else(|| {
            Error::Configuration(format!("quantity '{}' overflows", trimmed))
        })?;

        if !frac_part.is_empty() {
            let frac_value: i128 = frac_part.parse().map_err(|_| {
                Error::Configuration(format!("quantity '{}' is not a number", trimmed))
            })?;
            let scale = 10i128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(|| {
                    Error::Configuration(format!("quantity '{}' is too precise", trimmed))
                })?;
            let product = frac_value.checked_mul(multiplier).ok_or_else(|| {
                Error::Configuration(format!("quantity '{}' overflows", trimmed))
            })?;
            // Round up when the fraction does not divide evenly, like apimachinery.
            let frac_nanos = (product + scale - 1) / scale;
            nanos = nanos.checked_add(frac_nanos).ok_or_else(|| {
                Error::Configuration(format!("quantity '{}' overflows", trimmed))
            })?;
        }

        Ok(Self {
            raw: trimmed.to_string(),
            nanos,
        })
    }

    fn suffix_multiplier(suffix: &str, whole: &str) -> Result<i128> {
        const UNIT: i128 = 1_000_000_000; // one whole unit in nanos

        // Scientific notation: 'e' or 'E' followed by an exponent.
        if let Some(exp) = suffix
            .strip_prefix('e')
            .or_else(|| suffix.strip_prefix('E'))
        {
            if !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit()) {
                let exp: u32 = exp.parse().map_err(|_| {
                    Error::Configuration(format!("quantity '{}' has a bad exponent", whole))
                })?;
                return 10i128
                    .checked_pow(exp)
                    .and_then(|p| p.checked_mul(UNIT))
                    .ok_or_else(|| {
                        Error::Configuration(format!("quantity '{}' overflows", whole))
                    });
            }
        }

        match suffix {
            "n" => Ok(1),
            "u" => Ok(1_000),
            "m" => Ok(1_000_000),
            "" => Ok(UNIT),
            "k" => Ok(UNIT * 1_000),
            "M" => Ok(UNIT * 1_000_000),
            "G" => Ok(UNIT * 1_000_000_000),
            "T" => Ok(UNIT * 1_000_000_000_000),
            "P" => Ok(UNIT * 1_000_000_000_000_000),
            "E" => Ok(UNIT * 1_000_000_000_000_000_000),
            "Ki" => Ok(UNIT * 1_024),
            "Mi" => Ok(UNIT * 1_024 * 1_024),
            "Gi" => Ok(UNIT * 1_024 * 1_024 * 1_024),
            "Ti" => Ok(UNIT * 1_024 * 1_024 * 1_024 * 1_024),
            "Pi" => Ok(UNIT * 1_024 * 1_024 * 1_024 * 1_024 * 1_024),
            "Ei" => Ok(UNIT * 1_024 * 1_024 * 1_024 * 1_024 * 1_024 * 1_024),
            _ => Err(Error::Configuration(format!(
                "quantity '{}' has unknown suffix '{}'",
                whole, suffix
            ))),
        }
    }

    /// Parses the string inside a `k8s_openapi` quantity.
    pub fn from_k8s(q: &K8sQuantity) -> Result<Self> {
        Self::parse(&q.0)
    }

    /// Converts back into the wire representation, preserving the original string.
    pub fn to_k8s(&self) -> K8sQuantity {
        K8sQuantity(self.raw.clone())
    }

    /// Canonical value in nano-units.
    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for ResourceQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for ResourceQuantity {}

impl PartialOrd for ResourceQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}
