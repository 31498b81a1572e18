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

//! Identifiers for instruments and venues.

use std::{
    fmt::{Debug, Display},
    hash::Hash,
    str::FromStr,
};

use barflow_core::correctness::{FAILED, check_valid_string};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ustr::Ustr;

/// A valid ticker symbol identifier.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(Ustr);

impl Symbol {
    /// Creates a new [`Symbol`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid string.
    #[must_use]
    pub fn new(value: &str) -> Self {
        check_valid_string(value, stringify!(value)).expect(FAILED);
        Self(Ustr::from(value))
    }

    /// Returns the inner value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A valid trading venue identifier.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Venue(Ustr);

impl Venue {
    /// Creates a new [`Venue`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid string.
    #[must_use]
    pub fn new(value: &str) -> Self {
        check_valid_string(value, stringify!(value)).expect(FAILED);
        Self(Ustr::from(value))
    }

    /// Returns the inner value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A valid trade match ID assigned by a venue.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeId(Ustr);

impl TradeId {
    /// Creates a new [`TradeId`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid string.
    #[must_use]
    pub fn new(value: &str) -> Self {
        check_valid_string(value, stringify!(value)).expect(FAILED);
        Self(Ustr::from(value))
    }

    /// Returns the inner value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A valid instrument ID, being the symbol and venue dotted pair.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstrumentId {
    /// The instrument's ticker symbol.
    pub symbol: Symbol,
    /// The instrument's trading venue.
    pub venue: Venue,
}

impl InstrumentId {
    /// Creates a new [`InstrumentId`] instance.
    #[must_use]
    pub const fn new(symbol: Symbol, venue: Venue) -> Self {
        Self { symbol, venue }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Error parsing `InstrumentId` from '{input}': missing '.' separator")]
pub struct InstrumentIdParseError {
    input: String,
}

impl FromStr for InstrumentId {
    type Err = InstrumentIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((symbol, venue)) if !symbol.is_empty() && !venue.is_empty() => {
                Ok(Self::new(Symbol::new(symbol), Venue::new(venue)))
            }
            _ => Err(InstrumentIdParseError {
                input: s.to_string(),
            }),
        }
    }
}

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self::from_str(value).expect(FAILED)
    }
}

impl Debug for InstrumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(\"{self}\")", stringify!(InstrumentId))
    }
}

impl Display for InstrumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.symbol.as_str(), self.venue.as_str())
    }
}

impl Serialize for InstrumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstrumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! impl_display_debug_ustr {
    ($ty:ty) => {
        impl Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(\"{}\")", stringify!($ty), self.0)
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_display_debug_ustr!(Symbol);
impl_display_debug_ustr!(Venue);
impl_display_debug_ustr!(TradeId);

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_parse_and_display() {
        let id = InstrumentId::from("EURUSD.SIM");
        assert_eq!(id.symbol.as_str(), "EURUSD");
        assert_eq!(id.venue.as_str(), "SIM");
        assert_eq!(id.to_string(), "EURUSD.SIM");
    }

    #[rstest]
    fn test_parse_uses_last_separator() {
        let id = InstrumentId::from("BTC.USD.COINBASE");
        assert_eq!(id.symbol.as_str(), "BTC.USD");
        assert_eq!(id.venue.as_str(), "COINBASE");
    }

    #[rstest]
    #[case("EURUSD")]
    #[case(".SIM")]
    #[case("EURUSD.")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(InstrumentId::from_str(input).is_err());
    }
}
