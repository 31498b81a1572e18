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

//! Calendar-aware date/time arithmetic on nanosecond timestamps.
//!
//! Months are never approximated as a fixed nanosecond duration; the helpers
//! here round-trip through `chrono` so month-length and leap-year rules hold.

use chrono::{DateTime, Months, Utc};

use crate::nanos::UnixNanos;

/// Number of nanoseconds in one second.
pub const NANOSECONDS_IN_SECOND: u64 = 1_000_000_000;

/// Number of nanoseconds in one millisecond.
pub const NANOSECONDS_IN_MILLISECOND: u64 = 1_000_000;

/// Number of nanoseconds in one microsecond.
pub const NANOSECONDS_IN_MICROSECOND: u64 = 1_000;

/// Adds `n` months to a chrono `DateTime<Utc>`.
///
/// # Errors
///
/// Returns an error if the resulting date would be out of range.
pub fn add_n_months(datetime: DateTime<Utc>, n: u32) -> anyhow::Result<DateTime<Utc>> {
    datetime
        .checked_add_months(Months::new(n))
        .ok_or_else(|| anyhow::anyhow!("Failed to add {n} months to {datetime}"))
}

/// Subtracts `n` months from a chrono `DateTime<Utc>`.
///
/// # Errors
///
/// Returns an error if the resulting date would be out of range.
pub fn subtract_n_months(datetime: DateTime<Utc>, n: u32) -> anyhow::Result<DateTime<Utc>> {
    datetime
        .checked_sub_months(Months::new(n))
        .ok_or_else(|| anyhow::anyhow!("Failed to subtract {n} months from {datetime}"))
}

/// Adds `n` months to a UNIX nanoseconds timestamp.
///
/// # Errors
///
/// Returns an error if the resulting timestamp is out of range or negative.
pub fn add_n_months_nanos(unix_nanos: UnixNanos, n: u32) -> anyhow::Result<UnixNanos> {
    let result = add_n_months(unix_nanos.to_datetime_utc(), n)?;
    nanos_since_epoch(result, || format!("after adding {n} months"))
}

/// Subtracts `n` months from a UNIX nanoseconds timestamp.
///
/// # Errors
///
/// Returns an error if the resulting timestamp is out of range or negative.
pub fn subtract_n_months_nanos(unix_nanos: UnixNanos, n: u32) -> anyhow::Result<UnixNanos> {
    let result = subtract_n_months(unix_nanos.to_datetime_utc(), n)?;
    nanos_since_epoch(result, || format!("after subtracting {n} months"))
}

fn nanos_since_epoch(
    datetime: DateTime<Utc>,
    context: impl Fn() -> String,
) -> anyhow::Result<UnixNanos> {
    let timestamp = datetime
        .timestamp_nanos_opt()
        .ok_or_else(|| anyhow::anyhow!("Timestamp out of range {}", context()))?;

    if timestamp < 0 {
        anyhow::bail!("Negative timestamp not allowed {}", context());
    }

    Ok(UnixNanos::from(timestamp as u64))
}
