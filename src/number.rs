// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::cmp::Ordering;
use core::fmt::{Debug, Formatter};
use core::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::ser::Serializer;
use serde::Serialize;

/// A Stratus number.
///
/// Integers and floats are kept distinct so that integer arithmetic stays
/// exact; mixed-kind arithmetic promotes to float.
#[derive(Clone)]
pub enum Number {
    Int(i64),
    Float(f64),
}

use Number::*;

impl Number {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Int(i) => Some(*i),
            Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 => {
                Some(*f as i64)
            }
            Float(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.as_i64() {
            Some(i) if i >= 0 => Some(i as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Int(i) => *i as f64,
            Float(f) => *f,
        }
    }

    pub fn is_integer(&self) -> bool {
        match self {
            Int(_) => true,
            Float(f) => f.fract() == 0.0,
        }
    }

    pub fn add(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_add(*b) {
                Some(c) => Ok(Int(c)),
                None => bail!("addition overflow"),
            },
            _ => Ok(Float(self.as_f64() + rhs.as_f64())),
        }
    }

    pub fn sub(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_sub(*b) {
                Some(c) => Ok(Int(c)),
                None => bail!("subtraction overflow"),
            },
            _ => Ok(Float(self.as_f64() - rhs.as_f64())),
        }
    }

    pub fn mul(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (Int(a), Int(b)) => match a.checked_mul(*b) {
                Some(c) => Ok(Int(c)),
                None => bail!("multiplication overflow"),
            },
            _ => Ok(Float(self.as_f64() * rhs.as_f64())),
        }
    }

    pub fn divide(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (_, r) if r.as_f64() == 0.0 => bail!("divide by zero"),
            // Integer division that divides evenly stays an integer.
            // checked_rem is None only for i64::MIN / -1, which overflows.
            (Int(a), Int(b)) if a.checked_rem(*b).map_or(true, |r| r == 0) => {
                match a.checked_div(*b) {
                    Some(c) => Ok(Int(c)),
                    None => bail!("division overflow"),
                }
            }
            _ => Ok(Float(self.as_f64() / rhs.as_f64())),
        }
    }

    pub fn modulo(&self, rhs: &Self) -> Result<Number> {
        match (self, rhs) {
            (_, Int(0)) => bail!("modulo by zero"),
            (Int(a), Int(b)) => match a.checked_rem(*b) {
                Some(c) => Ok(Int(c)),
                None => bail!("modulo overflow"),
            },
            _ => bail!("modulo on floating-point number"),
        }
    }

    pub fn neg(&self) -> Result<Number> {
        match self {
            Int(a) => match a.checked_neg() {
                Some(c) => Ok(Int(c)),
                None => bail!("negation overflow"),
            },
            Float(f) => Ok(Float(-f)),
        }
    }
}

impl Debug for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Int(i) => i.fmt(f),
            Float(v) => v.fmt(f),
        }
    }
}

impl core::fmt::Display for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Int(i) => core::fmt::Display::fmt(i, f),
            Float(v) => core::fmt::Display::fmt(v, f),
        }
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        Int(n)
    }
}

impl From<u64> for Number {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(i) => Int(i),
            Err(_) => Float(n as f64),
        }
    }
}

impl From<usize> for Number {
    fn from(n: usize) -> Self {
        Number::from(n as u64)
    }
}

impl From<f64> for Number {
    fn from(n: f64) -> Self {
        // Whole-valued floats collapse to integers so that 2.0 == 2.
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
            Int(n as i64)
        } else {
            Float(n)
        }
    }
}

impl FromStr for Number {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Int(i));
        }
        match s.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Number::from(f)),
            _ => Err(anyhow!("invalid number `{s}`")),
        }
    }
}

impl Serialize for Number {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Int(i) => serializer.serialize_i64(*i),
            Float(f) => match self.as_i64() {
                // Serialize whole-valued floats without a fractional part.
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*f),
            },
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            // total_cmp gives a total order even for NaN.
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}
