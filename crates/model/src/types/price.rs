// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Represents a price in a market with a fixed decimal precision.

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    ops::{Add, Sub},
    str::FromStr,
};

use barflow_core::correctness::{FAILED, check_predicate_true};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::fixed::{FIXED_PRECISION, check_fixed_precision, f64_to_fixed_i64, fixed_i64_to_f64};

/// The raw fixed-point backing type for [`Price`].
pub type PriceRaw = i64;

/// The maximum representable price value.
pub const PRICE_MAX: f64 = 9_000_000_000.0;

/// The minimum representable price value.
pub const PRICE_MIN: f64 = -9_000_000_000.0;

/// Represents a price in a market.
///
/// The raw value is scaled to [`FIXED_PRECISION`] decimal places so that
/// comparisons and accumulation are exact integer operations. Equality and
/// ordering compare the raw value only; precision is a display attribute.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Price {
    /// The raw fixed-point value, scaled to `FIXED_PRECISION`.
    pub raw: PriceRaw,
    /// The display decimal precision.
    pub precision: u8,
}

impl Price {
    /// Creates a new [`Price`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a finite number within the
    /// representable range, or if `precision` exceeds [`FIXED_PRECISION`].
    pub fn new_checked(value: f64, precision: u8) -> anyhow::Result<Self> {
        check_predicate_true(
            value.is_finite(),
            &format!("`value` was not finite, was {value}"),
        )?;
        check_predicate_true(
            (PRICE_MIN..=PRICE_MAX).contains(&value),
            &format!("`value` out of range [{PRICE_MIN}, {PRICE_MAX}], was {value}"),
        )?;
        check_fixed_precision(precision)?;

        Ok(Self {
            raw: f64_to_fixed_i64(value, precision),
            precision,
        })
    }

    /// Creates a new [`Price`] instance.
    ///
    /// # Panics
    ///
    /// Panics if a correctness check fails. See [`Price::new_checked`] for details.
    #[must_use]
    pub fn new(value: f64, precision: u8) -> Self {
        Self::new_checked(value, precision).expect(FAILED)
    }

    /// Creates a new [`Price`] from a raw fixed-point value.
    ///
    /// # Panics
    ///
    /// Panics if `precision` exceeds [`FIXED_PRECISION`].
    #[must_use]
    pub fn from_raw(raw: PriceRaw, precision: u8) -> Self {
        check_fixed_precision(precision).expect(FAILED);
        Self { raw, precision }
    }

    /// Creates a zero-valued [`Price`] with the given `precision`.
    #[must_use]
    pub fn zero(precision: u8) -> Self {
        check_fixed_precision(precision).expect(FAILED);
        Self { raw: 0, precision }
    }

    /// Returns `true` if the price is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.raw == 0
    }

    /// Returns the value as an `f64`.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        fixed_i64_to_f64(self.raw)
    }

    /// Returns the value as an exact `Decimal` scaled to the display precision.
    #[must_use]
    pub fn as_decimal(&self) -> Decimal {
        let precision_diff = FIXED_PRECISION.saturating_sub(self.precision);
        let rescaled = self.raw / PriceRaw::pow(10, u32::from(precision_diff));
        Decimal::from_i128_with_scale(i128::from(rescaled), u32::from(self.precision))
    }
}

impl Hash for Price {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Price {}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw + rhs.raw,
            precision: self.precision.max(rhs.precision),
        }
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw - rhs.raw,
            precision: self.precision.max(rhs.precision),
        }
    }
}

impl FromStr for Price {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .parse()
            .map_err(|e| anyhow::anyhow!("Error parsing `Price` from '{s}': {e}"))?;
        let precision = precision_from_str(s);
        Self::new_checked(value, precision)
    }
}

impl From<&str> for Price {
    fn from(value: &str) -> Self {
        Self::from_str(value).expect(FAILED)
    }
}

impl Debug for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:.*})",
            stringify!(Price),
            self.precision as usize,
            self.as_f64()
        )
    }
}

impl Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.*}", self.precision as usize, self.as_f64())
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Returns the decimal precision inferred from a numeric string.
#[must_use]
pub fn precision_from_str(s: &str) -> u8 {
    match s.trim().split('.').nth(1) {
        Some(fraction) => fraction.len().min(usize::from(FIXED_PRECISION)) as u8,
        None => 0,
    }
}
