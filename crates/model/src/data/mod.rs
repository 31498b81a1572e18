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

//! Market data types for the aggregation engine.

pub mod bar;
pub mod quote;
pub mod trade;

use barflow_core::UnixNanos;
use serde::{Deserialize, Serialize};

pub use crate::data::{
    bar::{Bar, BarSpecification, BarType, BarTypeParseError, bar_interval, bar_interval_ns, time_bar_start},
    quote::QuoteTick,
    trade::TradeTick,
};
use crate::identifiers::InstrumentId;

/// A sum type for all market update events consumed by aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketEvent {
    /// A top-of-book quote update.
    Quote(QuoteTick),
    /// A trade print.
    Trade(TradeTick),
    /// An externally aggregated bar.
    Bar(Bar),
}

impl MarketEvent {
    /// Returns the [`InstrumentId`] for the event.
    #[must_use]
    pub const fn instrument_id(&self) -> InstrumentId {
        match self {
            Self::Quote(quote) => quote.instrument_id,
            Self::Trade(trade) => trade.instrument_id,
            Self::Bar(bar) => bar.bar_type.instrument_id(),
        }
    }

    /// Returns the UNIX timestamp (nanoseconds) when the event occurred.
    #[must_use]
    pub const fn ts_event(&self) -> UnixNanos {
        match self {
            Self::Quote(quote) => quote.ts_event,
            Self::Trade(trade) => trade.ts_event,
            Self::Bar(bar) => bar.ts_event,
        }
    }

    /// Returns the UNIX timestamp (nanoseconds) when the event was initialized.
    #[must_use]
    pub const fn ts_init(&self) -> UnixNanos {
        match self {
            Self::Quote(quote) => quote.ts_init,
            Self::Trade(trade) => trade.ts_init,
            Self::Bar(bar) => bar.ts_init,
        }
    }
}

impl From<QuoteTick> for MarketEvent {
    fn from(value: QuoteTick) -> Self {
        Self::Quote(value)
    }
}

impl From<TradeTick> for MarketEvent {
    fn from(value: TradeTick) -> Self {
        Self::Trade(value)
    }
}

impl From<Bar> for MarketEvent {
    fn from(value: Bar) -> Self {
        Self::Bar(value)
    }
}
