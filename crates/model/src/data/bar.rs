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

//! Bar aggregate structures, specifications, types and time-grid helpers.

use std::{
    fmt::Display,
    num::NonZeroUsize,
    str::FromStr,
};

use barflow_core::{
    UnixNanos,
    correctness::{FAILED, check_predicate_true},
    datetime::{add_n_months, subtract_n_months},
};
use chrono::{DateTime, Datelike, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    enums::{AggregationSource, BarAggregation, PriceType},
    identifiers::InstrumentId,
    types::{Price, Quantity},
};

/// Returns the bar interval as a `TimeDelta`.
///
/// Calendar months have no fixed duration, so [`BarAggregation::Month`]
/// returns a zero delta; month boundaries are resolved per instance with
/// [`add_n_months`].
///
/// # Panics
///
/// Panics if the aggregation method of the given `bar_type` is not time based.
pub fn bar_interval(bar_type: &BarType) -> TimeDelta {
    let spec = bar_type.spec();
    let step = spec.step.get() as i64;

    match spec.aggregation {
        BarAggregation::Millisecond => TimeDelta::milliseconds(step),
        BarAggregation::Second => TimeDelta::seconds(step),
        BarAggregation::Minute => TimeDelta::minutes(step),
        BarAggregation::Hour => TimeDelta::hours(step),
        BarAggregation::Day => TimeDelta::days(step),
        BarAggregation::Week => TimeDelta::days(7 * step),
        BarAggregation::Month => TimeDelta::zero(),
        _ => panic!("Aggregation not time based: {}", spec.aggregation),
    }
}

/// Returns the bar interval in nanoseconds.
///
/// # Panics
///
/// Panics if the aggregation method of the given `bar_type` is not time based.
#[must_use]
pub fn bar_interval_ns(bar_type: &BarType) -> UnixNanos {
    let interval_ns = bar_interval(bar_type)
        .num_nanoseconds()
        .expect("Invalid bar interval") as u64;
    UnixNanos::from(interval_ns)
}

// Largest grid point `anchor + k * step` not exceeding `now`, where `period`
// is the span one anchor unit covers (used when the offset pushed the anchor
// past `now`).
fn align_to_step(
    mut anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    period: TimeDelta,
    step: TimeDelta,
) -> DateTime<Utc> {
    if now < anchor {
        anchor -= period;
    }

    let step_ns = step.num_nanoseconds().expect("Invalid bar interval");
    let elapsed_ns = (now - anchor).num_nanoseconds().expect("Invalid elapsed time");
    anchor + TimeDelta::nanoseconds((elapsed_ns / step_ns) * step_ns)
}

/// Returns the start of the time bar containing `now` as a timezone-aware
/// `DateTime<Utc>`.
///
/// The grid is anchored at the natural boundary of the next-coarser unit
/// (second, minute, hour, midnight, Monday, or the first of January for
/// months), shifted by `origin_offset` when given.
///
/// # Errors
///
/// Returns an error if the aggregation method is not time based, or if month
/// arithmetic moves out of the representable range.
pub fn time_bar_start(
    now: DateTime<Utc>,
    bar_type: &BarType,
    origin_offset: Option<TimeDelta>,
) -> anyhow::Result<DateTime<Utc>> {
    let spec = bar_type.spec();
    let step = spec.step.get() as i64;
    let offset = origin_offset.unwrap_or_else(TimeDelta::zero);

    let second_start = now.with_nanosecond(0).expect("valid time");
    let minute_start = second_start - TimeDelta::seconds(i64::from(now.second()));
    let hour_start = minute_start - TimeDelta::minutes(i64::from(now.minute()));
    let day_start = hour_start - TimeDelta::hours(i64::from(now.hour()));

    let start = match spec.aggregation {
        BarAggregation::Millisecond => align_to_step(
            second_start + offset,
            now,
            TimeDelta::seconds(1),
            TimeDelta::milliseconds(step),
        ),
        BarAggregation::Second => align_to_step(
            minute_start + offset,
            now,
            TimeDelta::minutes(1),
            TimeDelta::seconds(step),
        ),
        BarAggregation::Minute => align_to_step(
            hour_start + offset,
            now,
            TimeDelta::hours(1),
            TimeDelta::minutes(step),
        ),
        BarAggregation::Hour => align_to_step(
            day_start + offset,
            now,
            TimeDelta::days(1),
            TimeDelta::hours(step),
        ),
        BarAggregation::Day => {
            let mut start = day_start + offset;
            if now < start {
                start -= TimeDelta::days(1);
            }
            start
        }
        BarAggregation::Week => {
            let week_start =
                day_start - TimeDelta::days(i64::from(now.weekday().num_days_from_monday()));
            let mut start = week_start + offset;
            if now < start {
                start -= TimeDelta::weeks(1);
            }
            start
        }
        BarAggregation::Month => {
            let year_start = now
                .with_month(1)
                .and_then(|dt| dt.with_day(1))
                .map(|dt| {
                    dt.with_nanosecond(0).expect("valid time")
                        - TimeDelta::seconds(i64::from(dt.second()))
                        - TimeDelta::minutes(i64::from(dt.minute()))
                        - TimeDelta::hours(i64::from(dt.hour()))
                })
                .ok_or_else(|| anyhow::anyhow!("Invalid year start for {now}"))?;

            let mut start = year_start + offset;
            if now < start {
                start = subtract_n_months(start, 12)?;
            }

            let months_step = step as u32;
            while start <= now {
                start = add_n_months(start, months_step)?;
            }
            subtract_n_months(start, months_step)?
        }
        aggregation => anyhow::bail!("Aggregation not time based: {aggregation}"),
    };

    Ok(start)
}

/// A bar aggregation specification: a step, an aggregation method and the
/// price type sampled from the input stream.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct BarSpecification {
    /// The step for binning samples for bar aggregation.
    pub step: NonZeroUsize,
    /// The type of bar aggregation.
    pub aggregation: BarAggregation,
    /// The price type to use for aggregation.
    pub price_type: PriceType,
}

impl BarSpecification {
    /// Creates a new [`BarSpecification`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if `step` is not positive (> 0).
    pub fn new_checked(
        step: usize,
        aggregation: BarAggregation,
        price_type: PriceType,
    ) -> anyhow::Result<Self> {
        let step = NonZeroUsize::new(step)
            .ok_or_else(|| anyhow::anyhow!("Invalid step: {step} (must be non-zero)"))?;
        Ok(Self {
            step,
            aggregation,
            price_type,
        })
    }

    /// Creates a new [`BarSpecification`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `step` is not positive (> 0).
    #[must_use]
    pub fn new(step: usize, aggregation: BarAggregation, price_type: PriceType) -> Self {
        Self::new_checked(step, aggregation, price_type).expect(FAILED)
    }

    /// Returns the specification's interval as a `TimeDelta`.
    ///
    /// # Panics
    ///
    /// Panics if the aggregation method is not of fixed duration.
    pub fn timedelta(&self) -> TimeDelta {
        let step = self.step.get() as i64;
        match self.aggregation {
            BarAggregation::Millisecond => TimeDelta::milliseconds(step),
            BarAggregation::Second => TimeDelta::seconds(step),
            BarAggregation::Minute => TimeDelta::minutes(step),
            BarAggregation::Hour => TimeDelta::hours(step),
            BarAggregation::Day => TimeDelta::days(step),
            BarAggregation::Week => TimeDelta::days(7 * step),
            _ => panic!(
                "Timedelta not supported for aggregation type: {:?}",
                self.aggregation
            ),
        }
    }

    /// Returns whether the aggregation method is time-driven.
    #[must_use]
    pub fn is_time_aggregated(&self) -> bool {
        matches!(
            self.aggregation,
            BarAggregation::Millisecond
                | BarAggregation::Second
                | BarAggregation::Minute
                | BarAggregation::Hour
                | BarAggregation::Day
                | BarAggregation::Week
                | BarAggregation::Month
        )
    }

    /// Returns whether the aggregation method is threshold-driven.
    #[must_use]
    pub fn is_threshold_aggregated(&self) -> bool {
        matches!(
            self.aggregation,
            BarAggregation::Tick | BarAggregation::Volume | BarAggregation::Value
        )
    }
}

impl Display for BarSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.step, self.aggregation, self.price_type)
    }
}

/// A bar type: the instrument ID, bar specification and aggregation source,
/// optionally deriving from a composite input series.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BarType {
    /// A standard bar type aggregated directly from market updates.
    Standard {
        /// The bar type's instrument ID.
        instrument_id: InstrumentId,
        /// The bar type's specification.
        spec: BarSpecification,
        /// The bar type's aggregation source.
        aggregation_source: AggregationSource,
    },
    /// A bar type aggregated from finer-granularity bars of the same instrument.
    Composite {
        /// The bar type's instrument ID.
        instrument_id: InstrumentId,
        /// The bar type's specification.
        spec: BarSpecification,
        /// The bar type's aggregation source.
        aggregation_source: AggregationSource,

        /// The step of the underlying input bars.
        composite_step: usize,
        /// The aggregation method of the underlying input bars.
        composite_aggregation: BarAggregation,
        /// The aggregation source of the underlying input bars.
        composite_aggregation_source: AggregationSource,
    },
}

impl BarType {
    /// Creates a new standard [`BarType`] instance.
    #[must_use]
    pub const fn new(
        instrument_id: InstrumentId,
        spec: BarSpecification,
        aggregation_source: AggregationSource,
    ) -> Self {
        Self::Standard {
            instrument_id,
            spec,
            aggregation_source,
        }
    }

    /// Creates a new composite [`BarType`] instance.
    #[must_use]
    pub const fn new_composite(
        instrument_id: InstrumentId,
        spec: BarSpecification,
        aggregation_source: AggregationSource,
        composite_step: usize,
        composite_aggregation: BarAggregation,
        composite_aggregation_source: AggregationSource,
    ) -> Self {
        Self::Composite {
            instrument_id,
            spec,
            aggregation_source,
            composite_step,
            composite_aggregation,
            composite_aggregation_source,
        }
    }

    /// Returns whether this instance is a standard bar type.
    #[must_use]
    pub const fn is_standard(&self) -> bool {
        matches!(self, Self::Standard { .. })
    }

    /// Returns whether this instance is a composite bar type.
    #[must_use]
    pub const fn is_composite(&self) -> bool {
        matches!(self, Self::Composite { .. })
    }

    /// Returns the standard bar type component.
    #[must_use]
    pub fn standard(&self) -> Self {
        match self {
            b @ Self::Standard { .. } => *b,
            Self::Composite {
                instrument_id,
                spec,
                aggregation_source,
                ..
            } => Self::new(*instrument_id, *spec, *aggregation_source),
        }
    }

    /// Returns the composite input bar type, or `self` for standard bar types.
    #[must_use]
    pub fn composite(&self) -> Self {
        match self {
            b @ Self::Standard { .. } => *b,
            Self::Composite {
                instrument_id,
                spec,
                composite_step,
                composite_aggregation,
                composite_aggregation_source,
                ..
            } => Self::new(
                *instrument_id,
                BarSpecification::new(*composite_step, *composite_aggregation, spec.price_type),
                *composite_aggregation_source,
            ),
        }
    }

    /// Returns the [`InstrumentId`] for this bar type.
    #[must_use]
    pub const fn instrument_id(&self) -> InstrumentId {
        match self {
            Self::Standard { instrument_id, .. } | Self::Composite { instrument_id, .. } => {
                *instrument_id
            }
        }
    }

    /// Returns the [`BarSpecification`] for this bar type.
    #[must_use]
    pub const fn spec(&self) -> BarSpecification {
        match self {
            Self::Standard { spec, .. } | Self::Composite { spec, .. } => *spec,
        }
    }

    /// Returns the [`AggregationSource`] for this bar type.
    #[must_use]
    pub const fn aggregation_source(&self) -> AggregationSource {
        match self {
            Self::Standard {
                aggregation_source, ..
            }
            | Self::Composite {
                aggregation_source, ..
            } => *aggregation_source,
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Error parsing `BarType` from '{input}', invalid token: '{token}' at position {position}")]
pub struct BarTypeParseError {
    input: String,
    token: String,
    position: usize,
}

impl BarTypeParseError {
    fn new(input: &str, token: &str, position: usize) -> Self {
        Self {
            input: input.to_string(),
            token: token.to_string(),
            position,
        }
    }
}

fn parse_standard_tokens(
    s: &str,
    standard: &str,
) -> Result<(InstrumentId, BarSpecification, AggregationSource), BarTypeParseError> {
    let mut tokens: Vec<&str> = standard.rsplitn(5, '-').collect();
    tokens.reverse();
    if tokens.len() != 5 {
        return Err(BarTypeParseError::new(s, "", 0));
    }

    let instrument_id = InstrumentId::from_str(tokens[0])
        .map_err(|_| BarTypeParseError::new(s, tokens[0], 0))?;
    let step: usize = tokens[1]
        .parse()
        .map_err(|_| BarTypeParseError::new(s, tokens[1], 1))?;
    let aggregation = BarAggregation::from_str(tokens[2])
        .map_err(|_| BarTypeParseError::new(s, tokens[2], 2))?;
    let price_type =
        PriceType::from_str(tokens[3]).map_err(|_| BarTypeParseError::new(s, tokens[3], 3))?;
    let aggregation_source = AggregationSource::from_str(tokens[4])
        .map_err(|_| BarTypeParseError::new(s, tokens[4], 4))?;

    let spec = BarSpecification::new_checked(step, aggregation, price_type)
        .map_err(|_| BarTypeParseError::new(s, tokens[1], 1))?;
    Ok((instrument_id, spec, aggregation_source))
}

impl FromStr for BarType {
    type Err = BarTypeParseError;

    /// Parses a bar type from its string form, for example
    /// `"BTCUSDT.BINANCE-3-MINUTE-LAST-INTERNAL@1-MINUTE-EXTERNAL"` for a
    /// composite bar type (the part after `'@'` names the input series).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (standard, composite) = match s.split_once('@') {
            Some((standard, composite)) => (standard, Some(composite)),
            None => (s, None),
        };

        let (instrument_id, spec, aggregation_source) = parse_standard_tokens(s, standard)?;

        let Some(composite) = composite else {
            return Ok(Self::new(instrument_id, spec, aggregation_source));
        };

        let mut tokens: Vec<&str> = composite.rsplitn(3, '-').collect();
        tokens.reverse();
        if tokens.len() != 3 {
            return Err(BarTypeParseError::new(s, "", 5));
        }

        let composite_step: usize = tokens[0]
            .parse()
            .map_err(|_| BarTypeParseError::new(s, tokens[0], 5))?;
        let composite_aggregation = BarAggregation::from_str(tokens[1])
            .map_err(|_| BarTypeParseError::new(s, tokens[1], 6))?;
        let composite_aggregation_source = AggregationSource::from_str(tokens[2])
            .map_err(|_| BarTypeParseError::new(s, tokens[2], 7))?;

        Ok(Self::new_composite(
            instrument_id,
            spec,
            aggregation_source,
            composite_step,
            composite_aggregation,
            composite_aggregation_source,
        ))
    }
}

impl From<&str> for BarType {
    fn from(value: &str) -> Self {
        Self::from_str(value).expect(FAILED)
    }
}

impl Display for BarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard {
                instrument_id,
                spec,
                aggregation_source,
            } => {
                write!(f, "{instrument_id}-{spec}-{aggregation_source}")
            }
            Self::Composite {
                instrument_id,
                spec,
                aggregation_source,
                composite_step,
                composite_aggregation,
                composite_aggregation_source,
            } => {
                write!(
                    f,
                    "{instrument_id}-{spec}-{aggregation_source}@{composite_step}-{composite_aggregation}-{composite_aggregation_source}"
                )
            }
        }
    }
}

impl Serialize for BarType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BarType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Represents an aggregated bar.
#[repr(C)]
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Bar {
    /// The bar type for this bar.
    pub bar_type: BarType,
    /// The bar's open price.
    pub open: Price,
    /// The bar's high price.
    pub high: Price,
    /// The bar's low price.
    pub low: Price,
    /// The bar's close price.
    pub close: Price,
    /// The bar's volume.
    pub volume: Quantity,
    /// UNIX timestamp (nanoseconds) when the data event occurred.
    pub ts_event: UnixNanos,
    /// UNIX timestamp (nanoseconds) when the struct was initialized.
    pub ts_init: UnixNanos,
}

impl Bar {
    /// Creates a new [`Bar`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if the OHLC values violate `low <= open, close <= high`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_checked(
        bar_type: BarType,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Quantity,
        ts_event: UnixNanos,
        ts_init: UnixNanos,
    ) -> anyhow::Result<Self> {
        check_predicate_true(high >= open, "high >= open")?;
        check_predicate_true(high >= low, "high >= low")?;
        check_predicate_true(high >= close, "high >= close")?;
        check_predicate_true(low <= open, "low <= open")?;
        check_predicate_true(low <= close, "low <= close")?;

        Ok(Self {
            bar_type,
            open,
            high,
            low,
            close,
            volume,
            ts_event,
            ts_init,
        })
    }

    /// Creates a new [`Bar`] instance.
    ///
    /// # Panics
    ///
    /// Panics if the OHLC values violate `low <= open, close <= high`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        bar_type: BarType,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Quantity,
        ts_event: UnixNanos,
        ts_init: UnixNanos,
    ) -> Self {
        Self::new_checked(bar_type, open, high, low, close, volume, ts_event, ts_init)
            .expect(FAILED)
    }

    /// Returns the [`InstrumentId`] for this bar.
    #[must_use]
    pub const fn instrument_id(&self) -> InstrumentId {
        self.bar_type.instrument_id()
    }
}

impl Display for Bar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.bar_type, self.open, self.high, self.low, self.close, self.volume, self.ts_event
        )
    }
}
