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

//! Market data value types for the barflow aggregation engine.
//!
//! Defines the fixed-point [`Price`](types::Price) and
//! [`Quantity`](types::Quantity) types, market event structs, and the bar
//! specification/type model consumed by the aggregators.

pub mod data;
pub mod enums;
pub mod identifiers;
pub mod types;

pub use data::{Bar, BarSpecification, BarType, MarketEvent, QuoteTick, TradeTick};
pub use identifiers::InstrumentId;
pub use types::{Price, Quantity};
