//! Rational time bases and timestamp rescaling.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A rational number, used for time bases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// Pipeline-wide time base: every unit leaving a stage is expressed in it.
    pub const MICROSECONDS: Rational = Rational {
        num: 1,
        den: 1_000_000,
    };

    pub const MILLISECONDS: Rational = Rational { num: 1, den: 1000 };

    /// 90kHz, the MPEG system clock.
    pub const MPEG: Rational = Rational { num: 1, den: 90000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn invert(&self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }

    /// Rescale `value` expressed in `self` into `target`, rounding to the
    /// nearest tick (halves away from zero).
    pub fn rescale(&self, value: i64, target: Rational) -> i64 {
        if *self == target {
            return value;
        }
        let num = value as i128 * self.num as i128 * target.den as i128;
        let den = self.den as i128 * target.num as i128;
        if den == 0 {
            return value;
        }
        let half = den.abs() / 2;
        let rounded = if (num < 0) == (den < 0) {
            (num.abs() + half) / den.abs()
        } else {
            -((num.abs() + half) / den.abs())
        };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn to_micros(&self, value: i64) -> i64 {
        self.rescale(value, Self::MICROSECONDS)
    }

    pub fn from_micros(&self, micros: i64) -> i64 {
        Self::MICROSECONDS.rescale(micros, *self)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MICROSECONDS
    }
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Self::new(num, den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
