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

//! Correctness checks for function argument and state validation.
//!
//! Checks return an `anyhow::Result` so that callers can either propagate the
//! error or promote it to a panic with [`FAILED`] at a construction boundary.

use std::fmt::Debug;

/// Standard expect message for correctness check promotion to panic.
pub const FAILED: &str = "Condition failed";

/// Checks the `predicate` is true.
///
/// # Errors
///
/// Returns an error with `fail_msg` if the predicate is false.
pub fn check_predicate_true(predicate: bool, fail_msg: &str) -> anyhow::Result<()> {
    if !predicate {
        anyhow::bail!("{fail_msg}")
    }
    Ok(())
}

/// Checks the `u64` value is positive (> 0).
///
/// # Errors
///
/// Returns an error if `value` is zero.
pub fn check_positive_u64(value: u64, param: &str) -> anyhow::Result<()> {
    if value == 0 {
        anyhow::bail!("invalid u64 for '{param}' not positive, was {value}")
    }
    Ok(())
}

/// Checks the string is not empty and contains no whitespace-only content.
///
/// # Errors
///
/// Returns an error if `s` is empty or all whitespace.
pub fn check_valid_string(s: &str, param: &str) -> anyhow::Result<()> {
    if s.trim().is_empty() {
        anyhow::bail!("invalid string for '{param}' was empty")
    }
    Ok(())
}

/// Checks the two values are equal.
///
/// # Errors
///
/// Returns an error if `lhs` is not equal to `rhs`.
pub fn check_equal<T: PartialEq + Debug>(
    lhs: &T,
    rhs: &T,
    lhs_param: &str,
    rhs_param: &str,
) -> anyhow::Result<()> {
    if lhs != rhs {
        anyhow::bail!("'{lhs_param}' {lhs:?} was not equal to '{rhs_param}' {rhs:?}")
    }
    Ok(())
}
