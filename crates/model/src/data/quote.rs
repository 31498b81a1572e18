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

//! A `QuoteTick` data type representing a top-of-book quote state.

use std::{cmp, fmt::Display};

use barflow_core::UnixNanos;
use serde::{Deserialize, Serialize};

use crate::{
    enums::PriceType,
    identifiers::InstrumentId,
    types::{Price, Quantity, fixed::FIXED_PRECISION},
};

/// Represents a single quote tick in a market.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteTick {
    /// The quote's instrument ID.
    pub instrument_id: InstrumentId,
    /// The top-of-book bid price.
    pub bid_price: Price,
    /// The top-of-book ask price.
    pub ask_price: Price,
    /// The top-of-book bid size.
    pub bid_size: Quantity,
    /// The top-of-book ask size.
    pub ask_size: Quantity,
    /// UNIX timestamp (nanoseconds) when the quote event occurred.
    pub ts_event: UnixNanos,
    /// UNIX timestamp (nanoseconds) when the struct was initialized.
    pub ts_init: UnixNanos,
}

impl QuoteTick {
    /// Creates a new [`QuoteTick`] instance.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub const fn new(
        instrument_id: InstrumentId,
        bid_price: Price,
        ask_price: Price,
        bid_size: Quantity,
        ask_size: Quantity,
        ts_event: UnixNanos,
        ts_init: UnixNanos,
    ) -> Self {
        Self {
            instrument_id,
            bid_price,
            ask_price,
            bid_size,
            ask_size,
            ts_event,
            ts_init,
        }
    }

    /// Returns the [`Price`] for this quote for the given `price_type`.
    ///
    /// The MID price averages the bid and ask, widening the precision by one
    /// decimal place (capped at the fixed-point maximum) so the midpoint of
    /// a one-tick spread remains representable.
    ///
    /// # Panics
    ///
    /// Panics if `price_type` is [`PriceType::Last`] (quotes carry no trade price).
    #[must_use]
    pub fn extract_price(&self, price_type: PriceType) -> Price {
        match price_type {
            PriceType::Bid => self.bid_price,
            PriceType::Ask => self.ask_price,
            PriceType::Mid => Price::from_raw(
                (self.bid_price.raw + self.ask_price.raw) / 2,
                cmp::min(self.bid_price.precision + 1, FIXED_PRECISION),
            ),
            PriceType::Last => panic!("Cannot extract with price type {price_type}"),
        }
    }

    /// Returns the [`Quantity`] for this quote for the given `price_type`.
    ///
    /// # Panics
    ///
    /// Panics if `price_type` is [`PriceType::Last`].
    #[must_use]
    pub fn extract_size(&self, price_type: PriceType) -> Quantity {
        match price_type {
            PriceType::Bid => self.bid_size,
            PriceType::Ask => self.ask_size,
            PriceType::Mid => Quantity::from_raw(
                (self.bid_size.raw + self.ask_size.raw) / 2,
                cmp::min(self.bid_size.precision + 1, FIXED_PRECISION),
            ),
            PriceType::Last => panic!("Cannot extract with price type {price_type}"),
        }
    }
}

impl Default for QuoteTick {
    /// Creates a new default [`QuoteTick`] instance for testing.
    fn default() -> Self {
        Self {
            instrument_id: InstrumentId::from("AUD/USD.SIM"),
            bid_price: Price::from("1.00000"),
            ask_price: Price::from("1.00001"),
            bid_size: Quantity::from(100_000_u64),
            ask_size: Quantity::from(100_000_u64),
            ts_event: UnixNanos::default(),
            ts_init: UnixNanos::default(),
        }
    }
}

impl Display for QuoteTick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.instrument_id,
            self.bid_price,
            self.ask_price,
            self.bid_size,
            self.ask_size,
            self.ts_event,
        )
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn quote() -> QuoteTick {
        QuoteTick {
            bid_price: Price::from("1.00000"),
            ask_price: Price::from("1.00010"),
            bid_size: Quantity::from(50_000_u64),
            ask_size: Quantity::from(100_000_u64),
            ..Default::default()
        }
    }

    #[rstest]
    fn test_extract_bid_and_ask() {
        let quote = quote();
        assert_eq!(quote.extract_price(PriceType::Bid), Price::from("1.00000"));
        assert_eq!(quote.extract_price(PriceType::Ask), Price::from("1.00010"));
        assert_eq!(
            quote.extract_size(PriceType::Bid),
            Quantity::from(50_000_u64)
        );
    }

    #[rstest]
    fn test_extract_mid_widens_precision() {
        let quote = quote();
        let mid = quote.extract_price(PriceType::Mid);
        assert_eq!(mid.precision, 6);
        assert_eq!(mid, Price::from("1.000050"));

        let mid_size = quote.extract_size(PriceType::Mid);
        assert_eq!(mid_size.as_f64(), 75_000.0);
    }

    #[rstest]
    #[should_panic]
    fn test_extract_last_panics() {
        let _ = quote().extract_price(PriceType::Last);
    }
}
