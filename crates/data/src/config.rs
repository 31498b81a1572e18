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

//! Configuration for bar aggregation.

use barflow_model::{
    data::BarSpecification,
    enums::{BarAggregation, BarIntervalType, PriceType},
};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Configuration for a single bar aggregation stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarAggregationConfig {
    /// The step for binning samples for bar aggregation.
    pub step: usize,
    /// The type of bar aggregation.
    pub aggregation: BarAggregation,
    /// The price type to use for aggregation.
    pub price_type: PriceType,
    /// The origin offset for the time bar grid, in nanoseconds from the
    /// natural boundary. Must be smaller in magnitude than one interval.
    #[serde(default)]
    pub time_bars_origin_offset_ns: Option<i64>,
    /// If time bars are timestamped at their close (otherwise at their open).
    #[serde(default = "default_true")]
    pub timestamp_on_close: bool,
    /// The interval convention for time bar boundaries.
    #[serde(default)]
    pub interval_type: BarIntervalType,
    /// If time bars with no updates are built and emitted, carrying the
    /// previous close forward.
    #[serde(default = "default_true")]
    pub build_with_no_updates: bool,
    /// If the first time bar is suppressed when its window opened before the
    /// aggregator was started.
    #[serde(default)]
    pub skip_first_non_full_bar: bool,
    /// Delay in nanoseconds applied to the bar build timer, allowing data in
    /// flight at the boundary to be included.
    #[serde(default)]
    pub bar_build_delay: u64,
    /// If revisions of externally aggregated bars are accepted. No aggregator
    /// currently enables revision semantics; late updates inside an emitted
    /// interval fall under the out-of-order drop rule.
    #[serde(default)]
    pub accepts_revisions: bool,
}

const fn default_true() -> bool {
    true
}

impl BarAggregationConfig {
    /// Creates a new [`BarAggregationConfig`] with defaults for every
    /// optional field.
    #[must_use]
    pub const fn new(step: usize, aggregation: BarAggregation, price_type: PriceType) -> Self {
        Self {
            step,
            aggregation,
            price_type,
            time_bars_origin_offset_ns: None,
            timestamp_on_close: true,
            interval_type: BarIntervalType::LeftOpen,
            build_with_no_updates: true,
            skip_first_non_full_bar: false,
            bar_build_delay: 0,
            accepts_revisions: false,
        }
    }

    /// Returns the [`BarSpecification`] for this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `step` is not positive (> 0).
    pub fn spec(&self) -> anyhow::Result<BarSpecification> {
        BarSpecification::new_checked(self.step, self.aggregation, self.price_type)
    }

    /// Returns the time bar grid origin offset as a `TimeDelta`.
    #[must_use]
    pub fn origin_offset(&self) -> Option<TimeDelta> {
        self.time_bars_origin_offset_ns.map(TimeDelta::nanoseconds)
    }
}
