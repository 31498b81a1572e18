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

//! Fixed-point conversion helpers.
//!
//! All prices and quantities are stored as integers scaled to
//! [`FIXED_PRECISION`] decimal places, so equality and threshold comparisons
//! are exact regardless of the instrument's display precision.

use barflow_core::correctness::FAILED;

/// The maximum fixed-point precision (decimal places).
pub const FIXED_PRECISION: u8 = 9;

/// The scalar for converting between `f64` and raw fixed-point values.
pub const FIXED_SCALAR: f64 = 1_000_000_000.0; // 10.0**FIXED_PRECISION

/// Checks the `precision` is within the allowed fixed-point range.
///
/// # Errors
///
/// Returns an error if `precision` exceeds [`FIXED_PRECISION`].
pub fn check_fixed_precision(precision: u8) -> anyhow::Result<()> {
    if precision > FIXED_PRECISION {
        anyhow::bail!(
            "`precision` exceeded maximum `FIXED_PRECISION` ({FIXED_PRECISION}), was {precision}"
        )
    }
    Ok(())
}

/// Converts an `f64` value to a raw fixed-point `i64` with the given `precision`.
///
/// # Panics
///
/// Panics if `precision` exceeds [`FIXED_PRECISION`].
#[must_use]
pub fn f64_to_fixed_i64(value: f64, precision: u8) -> i64 {
    check_fixed_precision(precision).expect(FAILED);
    let pow1 = 10_i64.pow(u32::from(precision));
    let pow2 = 10_i64.pow(u32::from(FIXED_PRECISION - precision));
    let rounded = (value * pow1 as f64).round() as i64;
    rounded * pow2
}

/// Converts an `f64` value to a raw fixed-point `u64` with the given `precision`.
///
/// # Panics
///
/// Panics if `precision` exceeds [`FIXED_PRECISION`].
#[must_use]
pub fn f64_to_fixed_u64(value: f64, precision: u8) -> u64 {
    check_fixed_precision(precision).expect(FAILED);
    let pow1 = 10_u64.pow(u32::from(precision));
    let pow2 = 10_u64.pow(u32::from(FIXED_PRECISION - precision));
    let rounded = (value * pow1 as f64).round() as u64;
    rounded * pow2
}

/// Converts a raw fixed-point `i64` back to `f64`.
#[must_use]
pub fn fixed_i64_to_f64(value: i64) -> f64 {
    value as f64 / FIXED_SCALAR
}

/// Converts a raw fixed-point `u64` back to `f64`.
#[must_use]
pub fn fixed_u64_to_f64(value: u64) -> f64 {
    value as f64 / FIXED_SCALAR
}
