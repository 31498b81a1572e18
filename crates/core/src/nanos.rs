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

//! A `UnixNanos` type for working with timestamps in nanoseconds since the UNIX epoch.

use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub, SubAssign},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a duration in nanoseconds.
pub type DurationNanos = u64;

/// Represents a timestamp in nanoseconds since the UNIX epoch.
///
/// Negative timestamps are not representable; arithmetic panics on
/// overflow/underflow rather than wrapping.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixNanos(u64);

impl UnixNanos {
    /// Creates a new [`UnixNanos`] instance.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns `true` if the value of this instance is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the underlying value as `u64`.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the underlying value as `i64`.
    ///
    /// # Panics
    ///
    /// Panics if the value exceeds `i64::MAX` (approximately year 2262).
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        assert!(
            self.0 <= i64::MAX as u64,
            "UnixNanos value exceeds i64::MAX"
        );
        self.0 as i64
    }

    /// Returns the underlying value as `f64`.
    #[must_use]
    pub const fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Converts the underlying value to a datetime (UTC).
    #[must_use]
    pub const fn to_datetime_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.as_i64())
    }

    /// Returns the RFC 3339 representation.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime_utc().to_rfc3339()
    }

    /// Saturating subtraction returning the difference in nanoseconds.
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> DurationNanos {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u64> for UnixNanos {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<UnixNanos> for u64 {
    fn from(value: UnixNanos) -> Self {
        value.0
    }
}

impl From<DateTime<Utc>> for UnixNanos {
    fn from(value: DateTime<Utc>) -> Self {
        let nanos = value
            .timestamp_nanos_opt()
            .expect("datetime out of range for UnixNanos");
        assert!(nanos >= 0, "negative timestamp not representable");
        Self(nanos as u64)
    }
}

impl FromStr for UnixNanos {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl PartialEq<u64> for UnixNanos {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u64> for UnixNanos {
    fn partial_cmp(&self, other: &u64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

impl Add for UnixNanos {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(
            self.0
                .checked_add(rhs.0)
                .expect("overflow adding `UnixNanos`"),
        )
    }
}

impl Sub for UnixNanos {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(
            self.0
                .checked_sub(rhs.0)
                .expect("underflow subtracting `UnixNanos`"),
        )
    }
}

impl Add<u64> for UnixNanos {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("overflow adding `UnixNanos`"))
    }
}

impl Sub<u64> for UnixNanos {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(
            self.0
                .checked_sub(rhs)
                .expect("underflow subtracting `UnixNanos`"),
        )
    }
}

impl AddAssign<u64> for UnixNanos {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl SubAssign<u64> for UnixNanos {
    fn sub_assign(&mut self, rhs: u64) {
        *self = *self - rhs;
    }
}

impl AddAssign for UnixNanos {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for UnixNanos {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Display for UnixNanos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_new_and_accessors() {
        let ts = UnixNanos::new(123_456_789);
        assert_eq!(ts.as_u64(), 123_456_789);
        assert_eq!(ts.as_i64(), 123_456_789);
        assert!(!ts.is_zero());
        assert!(UnixNanos::default().is_zero());
    }

    #[rstest]
    fn test_arithmetic() {
        let ts = UnixNanos::from(1_000);
        assert_eq!(ts + 500, UnixNanos::from(1_500));
        assert_eq!(ts - 500, UnixNanos::from(500));
        assert_eq!(ts + UnixNanos::from(1), UnixNanos::from(1_001));
        assert_eq!(UnixNanos::from(100).saturating_sub(UnixNanos::from(200)), 0);
    }

    #[rstest]
    #[should_panic]
    fn test_subtraction_underflow_panics() {
        let _ = UnixNanos::from(1) - 2;
    }

    #[rstest]
    fn test_datetime_round_trip() {
        let ts = UnixNanos::from(1_700_000_000_000_000_000);
        let dt = ts.to_datetime_utc();
        assert_eq!(UnixNanos::from(dt), ts);
    }

    #[rstest]
    fn test_comparison_with_u64() {
        let ts = UnixNanos::from(42);
        assert_eq!(ts, 42);
        assert!(ts > 41);
        assert!(ts < 43);
    }
}
