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

//! Bar aggregation machinery.
//!
//! Defines the `BarAggregator` trait and the concrete aggregators (tick,
//! volume, value, time), along with the `BarBuilder` and `BarAggregatorCore`
//! helpers for constructing bars.

use std::{
    any::Any,
    cell::RefCell,
    fmt::Debug,
    rc::{Rc, Weak},
};

use barflow_common::{
    clock::Clock,
    timer::{TimeEvent, TimeEventCallback},
};
use barflow_core::{
    UnixNanos,
    correctness::{self, FAILED, check_predicate_true},
    datetime::{add_n_months_nanos, subtract_n_months_nanos},
};
use barflow_model::{
    data::{
        Bar, BarType, MarketEvent, QuoteTick, TradeTick, bar_interval, bar_interval_ns,
        time_bar_start,
    },
    enums::{AggregationSource, BarAggregation, BarIntervalType},
    types::{Price, Quantity, fixed::FIXED_SCALAR, quantity::QuantityRaw},
};
use chrono::TimeDelta;
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};

use crate::config::BarAggregationConfig;

/// The emission mode of an aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationMode {
    /// Completed bars go to the registered live handler.
    Live,
    /// Completed bars go to the batch replay handler.
    Batch,
}

/// Trait for aggregating incoming market events into tick-, volume-, value-,
/// or time-based bars.
///
/// Implementors receive updates and produce completed bars via handlers, with
/// support for batch replay.
pub trait BarAggregator: Any + Debug {
    /// The [`BarType`] to be aggregated.
    fn bar_type(&self) -> BarType;

    /// If the aggregator is running and will receive data.
    fn is_running(&self) -> bool;

    /// Sets the running state of the aggregator (receiving updates when `true`).
    fn set_is_running(&mut self, value: bool);

    /// Updates the aggregator with the given price and size.
    fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos);

    /// Incorporates a finer-granularity bar and its volume into aggregation.
    fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos);

    /// Seeds the aggregator with a partially completed bar, resuming an
    /// interrupted window. Applied at most once, before regular updates.
    fn set_partial(&mut self, partial_bar: Bar);

    /// Updates the aggregator with the given market event.
    fn handle_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Quote(quote) => self.handle_quote(quote),
            MarketEvent::Trade(trade) => self.handle_trade(trade),
            MarketEvent::Bar(bar) => self.handle_bar(bar),
        }
    }

    /// Updates the aggregator with the given quote.
    fn handle_quote(&mut self, quote: QuoteTick) {
        let spec = self.bar_type().spec();
        self.update(
            quote.extract_price(spec.price_type),
            quote.extract_size(spec.price_type),
            quote.ts_init,
        );
    }

    /// Updates the aggregator with the given trade.
    fn handle_trade(&mut self, trade: TradeTick) {
        self.update(trade.price, trade.size, trade.ts_init);
    }

    /// Updates the aggregator with the given bar.
    fn handle_bar(&mut self, bar: Bar) {
        self.update_bar(bar, bar.volume, bar.ts_init);
    }

    /// Starts batch mode, sending completed bars to the supplied handler.
    /// `time_ns` gives the replay position used to anchor time-based grids.
    fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>, time_ns: UnixNanos);

    /// Stops batch mode and restores live emission. `resume_ns` gives the
    /// point in time at which live data resumes, used to reconcile any
    /// pending time-grid boundary.
    fn stop_batch_update(&mut self, resume_ns: UnixNanos);

    /// Stops the aggregator, e.g. cancels timers. Default is a no-op.
    fn stop(&mut self) {}
}

impl dyn BarAggregator {
    /// Returns a reference to this aggregator as `Any` for downcasting.
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// Returns a mutable reference to this aggregator as `Any` for downcasting.
    pub fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Provides a generic bar builder for aggregation.
#[derive(Debug)]
pub struct BarBuilder {
    bar_type: BarType,
    price_precision: u8,
    size_precision: u8,
    initialized: bool,
    partial_set: bool,
    ts_last: UnixNanos,
    count: usize,
    last_close: Option<Price>,
    open: Option<Price>,
    high: Option<Price>,
    low: Option<Price>,
    close: Option<Price>,
    volume: Quantity,
}

impl BarBuilder {
    /// Creates a new [`BarBuilder`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `bar_type.aggregation_source` is not `AggregationSource::Internal`.
    #[must_use]
    pub fn new(bar_type: BarType, price_precision: u8, size_precision: u8) -> Self {
        correctness::check_equal(
            &bar_type.aggregation_source(),
            &AggregationSource::Internal,
            "bar_type.aggregation_source",
            "AggregationSource::Internal",
        )
        .expect(FAILED);

        Self {
            bar_type,
            price_precision,
            size_precision,
            initialized: false,
            partial_set: false,
            ts_last: UnixNanos::default(),
            count: 0,
            last_close: None,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: Quantity::zero(size_precision),
        }
    }

    /// Returns the number of updates applied to the current window.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns the accumulated volume of the current window.
    #[must_use]
    pub const fn volume(&self) -> Quantity {
        self.volume
    }

    /// Seeds the builder with a partially completed bar.
    ///
    /// Applied at most once, before regular updates overwrite the window;
    /// subsequent calls are ignored.
    pub fn set_partial(&mut self, partial_bar: Bar) {
        if self.partial_set {
            return; // Already seeded
        }

        self.open = Some(partial_bar.open);

        if self.high.is_none_or(|high| partial_bar.high > high) {
            self.high = Some(partial_bar.high);
        }

        if self.low.is_none_or(|low| partial_bar.low < low) {
            self.low = Some(partial_bar.low);
        }

        if self.close.is_none() {
            self.close = Some(partial_bar.close);
        }

        self.volume = partial_bar.volume;

        if self.ts_last.is_zero() {
            self.ts_last = partial_bar.ts_init;
        }

        self.partial_set = true;
        self.initialized = true;
    }

    /// Updates the builder with the given price, size, and init timestamp.
    ///
    /// Updates timestamped before the last applied update are dropped.
    pub fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        if ts_init < self.ts_last {
            log::debug!(
                "Dropped out-of-order update: ts_init={ts_init} < ts_last={}",
                self.ts_last
            );
            return;
        }

        if self.open.is_none() {
            self.open = Some(price);
            self.high = Some(price);
            self.low = Some(price);
            self.initialized = true;
        } else {
            if self.high.is_some_and(|high| price > high) {
                self.high = Some(price);
            }
            if self.low.is_some_and(|low| price < low) {
                self.low = Some(price);
            }
        }

        self.close = Some(price);
        self.volume += size;
        self.count += 1;
        self.ts_last = ts_init;
    }

    /// Updates the builder with a completed bar, its volume, and the bar init
    /// timestamp.
    ///
    /// Updates timestamped before the last applied update are dropped.
    pub fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos) {
        if ts_init < self.ts_last {
            log::debug!(
                "Dropped out-of-order bar update: ts_init={ts_init} < ts_last={}",
                self.ts_last
            );
            return;
        }

        if self.open.is_none() {
            self.open = Some(bar.open);
            self.high = Some(bar.high);
            self.low = Some(bar.low);
            self.initialized = true;
        } else {
            if self.high.is_some_and(|high| bar.high > high) {
                self.high = Some(bar.high);
            }
            if self.low.is_some_and(|low| bar.low < low) {
                self.low = Some(bar.low);
            }
        }

        self.close = Some(bar.close);
        self.volume += volume;
        self.count += 1;
        self.ts_last = ts_init;
    }

    /// Resets the builder window.
    ///
    /// All stateful window fields return to their initial value; `last_close`
    /// and `ts_last` persist across windows.
    pub fn reset(&mut self) {
        self.open = None;
        self.high = None;
        self.low = None;
        self.volume = Quantity::zero(self.size_precision);
        self.count = 0;
    }

    /// Returns the aggregated bar at the last update time, then resets.
    pub fn build_now(&mut self) -> Bar {
        self.build(self.ts_last, self.ts_last)
    }

    /// Returns the aggregated bar for the given timestamps, then resets the
    /// builder.
    ///
    /// An empty window carries the previous close forward as all four prices.
    ///
    /// # Panics
    ///
    /// Panics if the builder has never been updated and no previous close
    /// exists (a caller defect).
    pub fn build(&mut self, ts_event: UnixNanos, ts_init: UnixNanos) -> Bar {
        if self.open.is_none() {
            self.open = self.last_close;
            self.high = self.last_close;
            self.low = self.last_close;
            self.close = self.last_close;
        }

        if let (Some(close), Some(low)) = (self.close, self.low)
            && close < low
        {
            self.low = Some(close);
        }

        if let (Some(close), Some(high)) = (self.close, self.high)
            && close > high
        {
            self.high = Some(close);
        }

        // SAFETY: The open was checked, so we can assume all prices are Some
        let bar = Bar::new(
            self.bar_type,
            self.open.unwrap(),
            self.high.unwrap(),
            self.low.unwrap(),
            self.close.unwrap(),
            self.volume,
            ts_event,
            ts_init,
        );

        self.last_close = self.close;
        self.reset();
        bar
    }
}

/// Provides a means of aggregating specified bar types and dispatching to a
/// registered handler.
pub struct BarAggregatorCore<H>
where
    H: FnMut(Bar),
{
    bar_type: BarType,
    builder: BarBuilder,
    handler: H,
    batch_handler: Option<Box<dyn FnMut(Bar)>>,
    is_running: bool,
    mode: AggregationMode,
}

impl<H: FnMut(Bar)> Debug for BarAggregatorCore<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(BarAggregatorCore))
            .field("bar_type", &self.bar_type)
            .field("builder", &self.builder)
            .field("is_running", &self.is_running)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<H> BarAggregatorCore<H>
where
    H: FnMut(Bar),
{
    /// Creates a new [`BarAggregatorCore`] instance.
    ///
    /// # Panics
    ///
    /// Panics if `bar_type.aggregation_source` is not `AggregationSource::Internal`.
    pub fn new(bar_type: BarType, price_precision: u8, size_precision: u8, handler: H) -> Self {
        Self {
            bar_type,
            builder: BarBuilder::new(bar_type, price_precision, size_precision),
            handler,
            batch_handler: None,
            is_running: false,
            mode: AggregationMode::Live,
        }
    }

    /// Returns the current emission mode.
    #[must_use]
    pub const fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Sets the running state of the aggregator (receives updates when `true`).
    pub const fn set_is_running(&mut self, value: bool) {
        self.is_running = value;
    }

    /// Seeds the builder with the given partially completed bar.
    pub fn set_partial(&mut self, partial_bar: Bar) {
        self.builder.set_partial(partial_bar);
    }

    fn apply_update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        self.builder.update(price, size, ts_init);
    }

    fn dispatch(&mut self, bar: Bar) {
        if self.mode == AggregationMode::Batch {
            if let Some(handler) = &mut self.batch_handler {
                handler(bar);
                return;
            }
        }
        (self.handler)(bar);
    }

    fn build_now_and_send(&mut self) {
        let bar = self.builder.build_now();
        self.dispatch(bar);
    }

    fn build_and_send(&mut self, ts_event: UnixNanos, ts_init: UnixNanos) {
        let bar = self.builder.build(ts_event, ts_init);
        self.dispatch(bar);
    }

    /// Enables batch mode, sending completed bars to the provided handler
    /// instead of the live handler.
    pub fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>) {
        self.mode = AggregationMode::Batch;
        self.batch_handler = Some(handler);
    }

    /// Disables batch mode and restores live emission.
    pub fn stop_batch_update(&mut self) {
        self.mode = AggregationMode::Live;
        self.batch_handler = None;
    }
}

/// Builds tick bars aggregated from quotes and trades.
///
/// When the received update count reaches the step threshold of the bar
/// specification, a bar is created and sent to the handler.
pub struct TickBarAggregator<H>
where
    H: FnMut(Bar),
{
    core: BarAggregatorCore<H>,
}

impl<H: FnMut(Bar)> Debug for TickBarAggregator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(TickBarAggregator))
            .field("core", &self.core)
            .finish()
    }
}

impl<H> TickBarAggregator<H>
where
    H: FnMut(Bar),
{
    /// Creates a new [`TickBarAggregator`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregation method of `bar_type` is not
    /// `BarAggregation::Tick`.
    pub fn new_checked(
        bar_type: BarType,
        price_precision: u8,
        size_precision: u8,
        handler: H,
    ) -> anyhow::Result<Self> {
        correctness::check_equal(
            &bar_type.spec().aggregation,
            &BarAggregation::Tick,
            "bar_type.spec().aggregation",
            "BarAggregation::Tick",
        )?;

        Ok(Self {
            core: BarAggregatorCore::new(
                bar_type.standard(),
                price_precision,
                size_precision,
                handler,
            ),
        })
    }

    /// Creates a new [`TickBarAggregator`] instance.
    ///
    /// # Panics
    ///
    /// Panics if a correctness check fails. See [`TickBarAggregator::new_checked`].
    pub fn new(bar_type: BarType, price_precision: u8, size_precision: u8, handler: H) -> Self {
        Self::new_checked(bar_type, price_precision, size_precision, handler).expect(FAILED)
    }
}

impl<H> BarAggregator for TickBarAggregator<H>
where
    H: FnMut(Bar) + 'static,
{
    fn bar_type(&self) -> BarType {
        self.core.bar_type
    }

    fn is_running(&self) -> bool {
        self.core.is_running
    }

    fn set_is_running(&mut self, value: bool) {
        self.core.set_is_running(value);
    }

    fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        self.core.apply_update(price, size, ts_init);

        if self.core.builder.count >= self.core.bar_type.spec().step.get() {
            self.core.build_now_and_send();
        }
    }

    fn set_partial(&mut self, partial_bar: Bar) {
        self.core.set_partial(partial_bar);
    }

    /// Each merged bar contributes a single count toward the threshold.
    fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos) {
        self.core.builder.update_bar(bar, volume, ts_init);

        if self.core.builder.count >= self.core.bar_type.spec().step.get() {
            self.core.build_now_and_send();
        }
    }

    fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>, _time_ns: UnixNanos) {
        self.core.start_batch_update(handler);
    }

    fn stop_batch_update(&mut self, _resume_ns: UnixNanos) {
        self.core.stop_batch_update();
    }
}

/// Builds volume bars aggregated from quotes and trades.
///
/// A single oversized update is split across as many bars as its size fills,
/// emitted synchronously; the remainder is retained for the next window.
pub struct VolumeBarAggregator<H>
where
    H: FnMut(Bar),
{
    core: BarAggregatorCore<H>,
}

impl<H: FnMut(Bar)> Debug for VolumeBarAggregator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(VolumeBarAggregator))
            .field("core", &self.core)
            .finish()
    }
}

impl<H> VolumeBarAggregator<H>
where
    H: FnMut(Bar),
{
    /// Creates a new [`VolumeBarAggregator`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregation method of `bar_type` is not
    /// `BarAggregation::Volume`.
    pub fn new_checked(
        bar_type: BarType,
        price_precision: u8,
        size_precision: u8,
        handler: H,
    ) -> anyhow::Result<Self> {
        correctness::check_equal(
            &bar_type.spec().aggregation,
            &BarAggregation::Volume,
            "bar_type.spec().aggregation",
            "BarAggregation::Volume",
        )?;

        Ok(Self {
            core: BarAggregatorCore::new(
                bar_type.standard(),
                price_precision,
                size_precision,
                handler,
            ),
        })
    }

    /// Creates a new [`VolumeBarAggregator`] instance.
    ///
    /// # Panics
    ///
    /// Panics if a correctness check fails. See [`VolumeBarAggregator::new_checked`].
    pub fn new(bar_type: BarType, price_precision: u8, size_precision: u8, handler: H) -> Self {
        Self::new_checked(bar_type, price_precision, size_precision, handler).expect(FAILED)
    }
}

impl<H> BarAggregator for VolumeBarAggregator<H>
where
    H: FnMut(Bar) + 'static,
{
    fn bar_type(&self) -> BarType {
        self.core.bar_type
    }

    fn is_running(&self) -> bool {
        self.core.is_running
    }

    fn set_is_running(&mut self, value: bool) {
        self.core.set_is_running(value);
    }

    fn set_partial(&mut self, partial_bar: Bar) {
        self.core.set_partial(partial_bar);
    }

    /// The split arithmetic runs on raw fixed-point sizes so no volume is
    /// created or destroyed by rounding.
    fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        let mut raw_size_update = size.raw;
        let raw_step =
            (self.core.bar_type.spec().step.get() as f64 * FIXED_SCALAR) as QuantityRaw;

        while raw_size_update > 0 {
            if self.core.builder.volume.raw + raw_size_update < raw_step {
                self.core.apply_update(
                    price,
                    Quantity::from_raw(raw_size_update, size.precision),
                    ts_init,
                );
                break;
            }

            let raw_size_diff = raw_step - self.core.builder.volume.raw;
            self.core.apply_update(
                price,
                Quantity::from_raw(raw_size_diff, size.precision),
                ts_init,
            );

            self.core.build_now_and_send();
            raw_size_update -= raw_size_diff;
        }
    }

    fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos) {
        let mut raw_volume_update = volume.raw;
        let raw_step =
            (self.core.bar_type.spec().step.get() as f64 * FIXED_SCALAR) as QuantityRaw;

        while raw_volume_update > 0 {
            if self.core.builder.volume.raw + raw_volume_update < raw_step {
                self.core.builder.update_bar(
                    bar,
                    Quantity::from_raw(raw_volume_update, volume.precision),
                    ts_init,
                );
                break;
            }

            let raw_volume_diff = raw_step - self.core.builder.volume.raw;
            self.core.builder.update_bar(
                bar,
                Quantity::from_raw(raw_volume_diff, volume.precision),
                ts_init,
            );

            self.core.build_now_and_send();
            raw_volume_update -= raw_volume_diff;
        }
    }

    fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>, _time_ns: UnixNanos) {
        self.core.start_batch_update(handler);
    }

    fn stop_batch_update(&mut self, _resume_ns: UnixNanos) {
        self.core.stop_batch_update();
    }
}

/// Builds value bars aggregated from quotes and trades.
///
/// When the cumulative notional (price * size) reaches the step threshold of
/// the bar specification, a bar is created and sent to the handler. The
/// accumulator is kept as an exact decimal; any overshoot from a crossing
/// update becomes the new cumulative value.
pub struct ValueBarAggregator<H>
where
    H: FnMut(Bar),
{
    core: BarAggregatorCore<H>,
    cum_value: Decimal,
}

impl<H: FnMut(Bar)> Debug for ValueBarAggregator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(ValueBarAggregator))
            .field("core", &self.core)
            .field("cum_value", &self.cum_value)
            .finish()
    }
}

impl<H> ValueBarAggregator<H>
where
    H: FnMut(Bar),
{
    /// Creates a new [`ValueBarAggregator`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregation method of `bar_type` is not
    /// `BarAggregation::Value`.
    pub fn new_checked(
        bar_type: BarType,
        price_precision: u8,
        size_precision: u8,
        handler: H,
    ) -> anyhow::Result<Self> {
        correctness::check_equal(
            &bar_type.spec().aggregation,
            &BarAggregation::Value,
            "bar_type.spec().aggregation",
            "BarAggregation::Value",
        )?;

        Ok(Self {
            core: BarAggregatorCore::new(
                bar_type.standard(),
                price_precision,
                size_precision,
                handler,
            ),
            cum_value: Decimal::ZERO,
        })
    }

    /// Creates a new [`ValueBarAggregator`] instance.
    ///
    /// # Panics
    ///
    /// Panics if a correctness check fails. See [`ValueBarAggregator::new_checked`].
    pub fn new(bar_type: BarType, price_precision: u8, size_precision: u8, handler: H) -> Self {
        Self::new_checked(bar_type, price_precision, size_precision, handler).expect(FAILED)
    }

    /// Returns the cumulative notional accumulated toward the next threshold.
    #[must_use]
    pub const fn cumulative_value(&self) -> Decimal {
        self.cum_value
    }

    fn apply_value_update(
        &mut self,
        price: Price,
        size_update: f64,
        size_precision: u8,
        ts_init: UnixNanos,
    ) {
        let threshold = Decimal::from(self.core.bar_type.spec().step.get());
        let mut size_update = size_update;

        while size_update > 0.0 {
            let value_update =
                price.as_decimal() * Decimal::from_f64(size_update).unwrap_or_default();
            if self.cum_value + value_update < threshold {
                self.cum_value += value_update;
                self.core
                    .apply_update(price, Quantity::new(size_update, size_precision), ts_init);
                break;
            }

            let value_diff = threshold - self.cum_value;
            let ratio = (value_diff / value_update).to_f64().unwrap_or(0.0);
            let size_diff = size_update * ratio;
            self.core
                .apply_update(price, Quantity::new(size_diff, size_precision), ts_init);

            self.core.build_now_and_send();
            self.cum_value = Decimal::ZERO;
            size_update -= size_diff;
        }
    }
}

impl<H> BarAggregator for ValueBarAggregator<H>
where
    H: FnMut(Bar) + 'static,
{
    fn bar_type(&self) -> BarType {
        self.core.bar_type
    }

    fn is_running(&self) -> bool {
        self.core.is_running
    }

    fn set_is_running(&mut self, value: bool) {
        self.core.set_is_running(value);
    }

    fn set_partial(&mut self, partial_bar: Bar) {
        self.core.set_partial(partial_bar);
    }

    fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        self.apply_value_update(price, size.as_f64(), size.precision, ts_init);
    }

    /// Merged bars contribute at their typical price (high + low + close) / 3.
    fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos) {
        let threshold = Decimal::from(self.core.bar_type.spec().step.get());
        let typical_price = Price::new(
            (bar.high.as_f64() + bar.low.as_f64() + bar.close.as_f64()) / 3.0,
            self.core.builder.price_precision,
        );
        let mut volume_update = volume.as_f64();

        while volume_update > 0.0 {
            let value_update =
                typical_price.as_decimal() * Decimal::from_f64(volume_update).unwrap_or_default();
            if self.cum_value + value_update < threshold {
                self.cum_value += value_update;
                self.core.builder.update_bar(
                    bar,
                    Quantity::new(volume_update, volume.precision),
                    ts_init,
                );
                break;
            }

            let value_diff = threshold - self.cum_value;
            let ratio = (value_diff / value_update).to_f64().unwrap_or(0.0);
            let volume_diff = volume_update * ratio;
            self.core.builder.update_bar(
                bar,
                Quantity::new(volume_diff, volume.precision),
                ts_init,
            );

            self.core.build_now_and_send();
            self.cum_value = Decimal::ZERO;
            volume_update -= volume_diff;
        }
    }

    fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>, _time_ns: UnixNanos) {
        self.core.start_batch_update(handler);
    }

    fn stop_batch_update(&mut self, _resume_ns: UnixNanos) {
        self.core.stop_batch_update();
    }
}

/// Callback wrapper bridging timer events to time bar aggregation.
///
/// Holds a weak reference to a [`TimeBarAggregator`] and triggers bar
/// creation when timer events fire, without keeping the aggregator alive.
#[derive(Clone, Debug)]
pub struct NewBarCallback<H: FnMut(Bar)> {
    aggregator: Weak<RefCell<TimeBarAggregator<H>>>,
}

impl<H: FnMut(Bar)> NewBarCallback<H> {
    /// Creates a new callback that invokes the time bar aggregator on timer
    /// events.
    #[must_use]
    pub fn new(aggregator: &Rc<RefCell<TimeBarAggregator<H>>>) -> Self {
        Self {
            aggregator: Rc::downgrade(aggregator),
        }
    }
}

impl<H: FnMut(Bar) + 'static> From<NewBarCallback<H>> for TimeEventCallback {
    fn from(value: NewBarCallback<H>) -> Self {
        Self::from(move |event: TimeEvent| {
            if let Some(aggregator) = value.aggregator.upgrade() {
                aggregator.borrow_mut().build_bar(event);
            }
        })
    }
}

/// Builds time bars aggregated from quotes, trades, and finer bars.
///
/// At each interval boundary on the clock grid a bar is created and sent to
/// the handler. MONTH intervals are calendar-resolved per instance rather
/// than treated as a fixed duration.
pub struct TimeBarAggregator<H>
where
    H: FnMut(Bar),
{
    core: BarAggregatorCore<H>,
    clock: Rc<RefCell<dyn Clock>>,
    build_with_no_updates: bool,
    timestamp_on_close: bool,
    is_left_open: bool,
    build_on_next_tick: bool,
    stored_open_ns: UnixNanos,
    stored_close_ns: UnixNanos,
    timer_name: String,
    interval_ns: UnixNanos,
    next_close_ns: UnixNanos,
    bar_build_delay: u64,
    batch_open_ns: UnixNanos,
    batch_next_close_ns: UnixNanos,
    time_bars_origin_offset: Option<TimeDelta>,
    skip_first_non_full_bar: bool,
}

impl<H: FnMut(Bar)> Debug for TimeBarAggregator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(TimeBarAggregator))
            .field("core", &self.core)
            .field("build_with_no_updates", &self.build_with_no_updates)
            .field("timestamp_on_close", &self.timestamp_on_close)
            .field("is_left_open", &self.is_left_open)
            .field("timer_name", &self.timer_name)
            .field("interval_ns", &self.interval_ns)
            .field("bar_build_delay", &self.bar_build_delay)
            .field("skip_first_non_full_bar", &self.skip_first_non_full_bar)
            .finish()
    }
}

impl<H> TimeBarAggregator<H>
where
    H: FnMut(Bar) + 'static,
{
    /// Creates a new [`TimeBarAggregator`] instance with correctness checking.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The aggregation method of `bar_type` is not time based.
    /// - The specification of `config` disagrees with `bar_type.spec()`.
    /// - The configured origin offset magnitude reaches one interval.
    pub fn new_checked(
        bar_type: BarType,
        price_precision: u8,
        size_precision: u8,
        clock: Rc<RefCell<dyn Clock>>,
        handler: H,
        config: &BarAggregationConfig,
    ) -> anyhow::Result<Self> {
        let spec = bar_type.spec();
        check_predicate_true(
            spec.is_time_aggregated(),
            &format!("Aggregation not time based: {}", spec.aggregation),
        )?;
        correctness::check_equal(
            &config.spec()?,
            &spec,
            "config.spec()",
            "bar_type.spec()",
        )?;

        let time_bars_origin_offset = config.origin_offset();
        if let Some(offset) = time_bars_origin_offset {
            // The shortest month has 28 days; fixed intervals use their exact span
            let max_offset = if spec.aggregation == BarAggregation::Month {
                TimeDelta::days(28 * spec.step.get() as i64)
            } else {
                bar_interval(&bar_type)
            };
            check_predicate_true(
                offset.abs() < max_offset,
                &format!(
                    "`time_bars_origin_offset` {offset} must be smaller in magnitude than one interval {max_offset}"
                ),
            )?;
        }

        let core = BarAggregatorCore::new(
            bar_type.standard(),
            price_precision,
            size_precision,
            handler,
        );

        Ok(Self {
            core,
            clock,
            build_with_no_updates: config.build_with_no_updates,
            timestamp_on_close: config.timestamp_on_close,
            is_left_open: config.interval_type == BarIntervalType::LeftOpen,
            build_on_next_tick: false,
            stored_open_ns: UnixNanos::default(),
            stored_close_ns: UnixNanos::default(),
            timer_name: bar_type.to_string(),
            interval_ns: bar_interval_ns(&bar_type),
            next_close_ns: UnixNanos::default(),
            bar_build_delay: config.bar_build_delay,
            batch_open_ns: UnixNanos::default(),
            batch_next_close_ns: UnixNanos::default(),
            time_bars_origin_offset,
            skip_first_non_full_bar: config.skip_first_non_full_bar,
        })
    }

    /// Creates a new [`TimeBarAggregator`] instance.
    ///
    /// # Panics
    ///
    /// Panics if a correctness check fails. See [`TimeBarAggregator::new_checked`].
    pub fn new(
        bar_type: BarType,
        price_precision: u8,
        size_precision: u8,
        clock: Rc<RefCell<dyn Clock>>,
        handler: H,
        config: &BarAggregationConfig,
    ) -> Self {
        Self::new_checked(
            bar_type,
            price_precision,
            size_precision,
            clock,
            handler,
            config,
        )
        .expect(FAILED)
    }

    /// Starts the aggregator, scheduling periodic bar builds on the clock.
    ///
    /// The first close snaps to the time grid containing the current clock
    /// time; MONTH intervals are scheduled as one-shot alerts which
    /// reschedule on each build.
    ///
    /// # Errors
    ///
    /// Returns an error if the grid start cannot be resolved or the clock
    /// timer registration fails.
    pub fn start(&mut self, callback: NewBarCallback<H>) -> anyhow::Result<()> {
        let now = self.clock.borrow().utc_now();
        let mut start_time = time_bar_start(now, &self.bar_type(), self.time_bars_origin_offset)?;

        if start_time == now {
            // The window opens exactly now, so the first bar is full
            self.skip_first_non_full_bar = false;
        }

        start_time += TimeDelta::nanoseconds(self.bar_build_delay as i64);

        let spec = self.bar_type().spec();
        let start_time_ns = UnixNanos::from(start_time);

        if spec.aggregation == BarAggregation::Month {
            let step = spec.step.get() as u32;
            let alert_time_ns = add_n_months_nanos(start_time_ns, step)?;

            self.clock.borrow_mut().set_time_alert_ns(
                &self.timer_name,
                alert_time_ns,
                Some(callback.into()),
                None,
            )?;

            self.next_close_ns = alert_time_ns;
        } else {
            self.clock.borrow_mut().set_timer_ns(
                &self.timer_name,
                self.interval_ns.as_u64(),
                start_time_ns,
                None,
                Some(callback.into()),
                None,
                None,
            )?;

            self.next_close_ns = self
                .clock
                .borrow()
                .next_time_ns(&self.timer_name)
                .unwrap_or_default();
        }

        log::debug!("Started timer {}", self.timer_name);
        Ok(())
    }

    /// Stops the aggregator, canceling its timer.
    pub fn stop(&mut self) {
        self.clock.borrow_mut().cancel_timer(&self.timer_name);
    }

    /// Anchors the batch replay grid at the window containing `time_ns`.
    ///
    /// # Panics
    ///
    /// Panics if month arithmetic fails for monthly intervals.
    pub fn start_batch_time(&mut self, time_ns: UnixNanos) {
        let spec = self.bar_type().spec();

        let time = time_ns.to_datetime_utc();
        let start_time = time_bar_start(time, &self.bar_type(), self.time_bars_origin_offset)
            .expect(FAILED);
        self.batch_open_ns = UnixNanos::from(start_time);

        if spec.aggregation == BarAggregation::Month {
            let step = spec.step.get() as u32;

            if self.batch_open_ns == time_ns {
                self.batch_open_ns =
                    subtract_n_months_nanos(self.batch_open_ns, step).expect(FAILED);
            }

            self.batch_next_close_ns = add_n_months_nanos(self.batch_open_ns, step).expect(FAILED);
        } else {
            if self.batch_open_ns == time_ns {
                self.batch_open_ns -= self.interval_ns;
            }

            self.batch_next_close_ns = self.batch_open_ns + self.interval_ns;
        }
    }

    const fn bar_ts_event(&self, open_ns: UnixNanos, close_ns: UnixNanos) -> UnixNanos {
        if self.is_left_open {
            if self.timestamp_on_close { close_ns } else { open_ns }
        } else {
            open_ns
        }
    }

    fn build_and_send(&mut self, ts_event: UnixNanos, ts_init: UnixNanos) {
        if self.skip_first_non_full_bar {
            self.core.builder.reset();
            self.skip_first_non_full_bar = false;
        } else {
            self.core.build_and_send(ts_event, ts_init);
        }
    }

    fn batch_pre_update(&mut self, time_ns: UnixNanos) {
        if time_ns > self.batch_next_close_ns && self.core.builder.initialized {
            let ts_init = self.batch_next_close_ns;
            let ts_event = self.bar_ts_event(self.batch_open_ns, ts_init);
            self.build_and_send(ts_event, ts_init);
        }
    }

    fn batch_post_update(&mut self, time_ns: UnixNanos) {
        let step = self.bar_type().spec().step.get() as u32;

        // When live again and time matches the pending close, clear the grid
        if self.core.mode == AggregationMode::Live
            && time_ns == self.batch_next_close_ns
            && time_ns > self.stored_open_ns
        {
            self.batch_next_close_ns = UnixNanos::default();
            return;
        }

        if time_ns > self.batch_next_close_ns {
            // Re-anchor the batch grid to the window containing this update
            if self.bar_type().spec().aggregation == BarAggregation::Month {
                while self.batch_next_close_ns < time_ns {
                    self.batch_next_close_ns =
                        add_n_months_nanos(self.batch_next_close_ns, step).expect(FAILED);
                }

                self.batch_open_ns =
                    subtract_n_months_nanos(self.batch_next_close_ns, step).expect(FAILED);
            } else {
                while self.batch_next_close_ns < time_ns {
                    self.batch_next_close_ns += self.interval_ns;
                }

                self.batch_open_ns = self.batch_next_close_ns - self.interval_ns;
            }
        }

        if time_ns == self.batch_next_close_ns {
            let ts_event = self.bar_ts_event(self.batch_open_ns, self.batch_next_close_ns);
            self.build_and_send(ts_event, time_ns);
            self.batch_open_ns = self.batch_next_close_ns;

            if self.bar_type().spec().aggregation == BarAggregation::Month {
                self.batch_next_close_ns =
                    add_n_months_nanos(self.batch_next_close_ns, step).expect(FAILED);
            } else {
                self.batch_next_close_ns += self.interval_ns;
            }
        }

        // Once live, a boundary surviving the batch has now been handled
        if self.core.mode == AggregationMode::Live {
            self.batch_next_close_ns = UnixNanos::default();
        }
    }

    fn build_bar(&mut self, event: TimeEvent) {
        if !self.core.builder.initialized {
            self.build_on_next_tick = true;
            self.stored_close_ns = self.next_close_ns;
            return;
        }

        if !self.build_with_no_updates && self.core.builder.count == 0 {
            return;
        }

        let ts_init = event.ts_event;
        let ts_event = self.bar_ts_event(self.stored_open_ns, ts_init);
        self.build_and_send(ts_event, ts_init);

        self.stored_open_ns = ts_init;

        if self.bar_type().spec().aggregation == BarAggregation::Month {
            let step = self.bar_type().spec().step.get() as u32;
            let next_alert_ns = add_n_months_nanos(ts_init, step).expect(FAILED);

            self.clock
                .borrow_mut()
                .set_time_alert_ns(&self.timer_name, next_alert_ns, None, None)
                .expect(FAILED);

            self.next_close_ns = next_alert_ns;
        } else {
            self.next_close_ns = self
                .clock
                .borrow()
                .next_time_ns(&self.timer_name)
                .unwrap_or_default();
        }
    }
}

impl<H> BarAggregator for TimeBarAggregator<H>
where
    H: FnMut(Bar) + 'static,
{
    fn bar_type(&self) -> BarType {
        self.core.bar_type
    }

    fn is_running(&self) -> bool {
        self.core.is_running
    }

    fn set_is_running(&mut self, value: bool) {
        self.core.set_is_running(value);
    }

    fn stop(&mut self) {
        Self::stop(self);
    }

    fn set_partial(&mut self, partial_bar: Bar) {
        self.core.set_partial(partial_bar);
    }

    fn update(&mut self, price: Price, size: Quantity, ts_init: UnixNanos) {
        if !self.batch_next_close_ns.is_zero() {
            self.batch_pre_update(ts_init);
        }

        self.core.apply_update(price, size, ts_init);

        if self.build_on_next_tick {
            if ts_init <= self.stored_close_ns {
                let ts_event = self.bar_ts_event(self.stored_open_ns, self.stored_close_ns);
                self.build_and_send(ts_event, ts_init);
            }

            self.build_on_next_tick = false;
            self.stored_close_ns = UnixNanos::default();
        }

        if !self.batch_next_close_ns.is_zero() {
            self.batch_post_update(ts_init);
        }
    }

    fn update_bar(&mut self, bar: Bar, volume: Quantity, ts_init: UnixNanos) {
        if !self.batch_next_close_ns.is_zero() {
            self.batch_pre_update(ts_init);
        }

        self.core.builder.update_bar(bar, volume, ts_init);

        if self.build_on_next_tick {
            if ts_init <= self.stored_close_ns {
                let ts_event = self.bar_ts_event(self.stored_open_ns, self.stored_close_ns);
                self.build_and_send(ts_event, ts_init);
            }

            self.build_on_next_tick = false;
            self.stored_close_ns = UnixNanos::default();
        }

        if !self.batch_next_close_ns.is_zero() {
            self.batch_post_update(ts_init);
        }
    }

    fn start_batch_update(&mut self, handler: Box<dyn FnMut(Bar)>, time_ns: UnixNanos) {
        self.core.start_batch_update(handler);
        self.start_batch_time(time_ns);
    }

    fn stop_batch_update(&mut self, resume_ns: UnixNanos) {
        self.core.stop_batch_update();

        // A boundary at or before `resume_ns` was the batch's to emit and
        // must not replay through the live handler; only a future boundary
        // survives into live aggregation
        if self.batch_next_close_ns <= resume_ns {
            self.batch_next_close_ns = UnixNanos::default();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use barflow_common::clock::TestClock;
    use barflow_model::{
        data::BarSpecification,
        enums::PriceType,
        identifiers::InstrumentId,
    };
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    use super::*;

    const MINUTE_NS: u64 = 60_000_000_000;

    type SharedBars = Rc<RefCell<Vec<Bar>>>;

    fn collecting_handler() -> (SharedBars, Box<dyn FnMut(Bar)>) {
        let bars: SharedBars = Rc::new(RefCell::new(Vec::new()));
        let sink = bars.clone();
        (bars, Box::new(move |bar: Bar| sink.borrow_mut().push(bar)))
    }

    fn bar_type(step: usize, aggregation: BarAggregation) -> BarType {
        BarType::new(
            InstrumentId::from("BTCUSDT.BINANCE"),
            BarSpecification::new(step, aggregation, PriceType::Last),
            AggregationSource::Internal,
        )
    }

    fn sample_bar(bar_type: BarType, close: &str, volume: u64, ts: u64) -> Bar {
        Bar::new(
            bar_type,
            Price::from(close),
            Price::from(close),
            Price::from(close),
            Price::from(close),
            Quantity::from(volume),
            UnixNanos::from(ts),
            UnixNanos::from(ts),
        )
    }

    ////////////////////////////////////////////////////////////////////////////
    // BarBuilder
    ////////////////////////////////////////////////////////////////////////////

    #[rstest]
    fn test_builder_initialization() {
        let builder = BarBuilder::new(bar_type(3, BarAggregation::Tick), 2, 0);
        assert!(!builder.initialized);
        assert_eq!(builder.ts_last, 0);
        assert_eq!(builder.count(), 0);
    }

    #[rstest]
    #[should_panic]
    fn test_builder_rejects_external_source() {
        let external = BarType::new(
            InstrumentId::from("BTCUSDT.BINANCE"),
            BarSpecification::new(3, BarAggregation::Tick, PriceType::Last),
            AggregationSource::External,
        );
        let _ = BarBuilder::new(external, 2, 0);
    }

    #[rstest]
    fn test_builder_maintains_ohlc_order() {
        let mut builder = BarBuilder::new(bar_type(3, BarAggregation::Tick), 2, 0);
        builder.update(Price::from("100.00"), Quantity::from(1_u64), UnixNanos::from(1_000));
        builder.update(Price::from("95.00"), Quantity::from(1_u64), UnixNanos::from(2_000));
        builder.update(Price::from("105.00"), Quantity::from(1_u64), UnixNanos::from(3_000));

        let bar = builder.build_now();
        assert_eq!(bar.open, Price::from("100.00"));
        assert_eq!(bar.high, Price::from("105.00"));
        assert_eq!(bar.low, Price::from("95.00"));
        assert_eq!(bar.close, Price::from("105.00"));
        assert_eq!(bar.volume, Quantity::from(3_u64));
    }

    #[rstest]
    fn test_builder_drops_out_of_order_update() {
        let mut builder = BarBuilder::new(bar_type(3, BarAggregation::Tick), 2, 0);
        builder.update(Price::from("100.00"), Quantity::from(1_u64), UnixNanos::from(2_000));
        builder.update(Price::from("50.00"), Quantity::from(1_u64), UnixNanos::from(1_000));

        assert_eq!(builder.count(), 1);
        let bar = builder.build_now();
        assert_eq!(bar.low, Price::from("100.00"));
        assert_eq!(bar.volume, Quantity::from(1_u64));
    }

    #[rstest]
    fn test_builder_carries_last_close_forward() {
        let mut builder = BarBuilder::new(bar_type(3, BarAggregation::Tick), 2, 0);
        builder.update(Price::from("100.00"), Quantity::from(1_u64), UnixNanos::from(1_000));
        let _ = builder.build_now();

        let empty = builder.build(UnixNanos::from(2_000), UnixNanos::from(2_000));
        assert_eq!(empty.open, Price::from("100.00"));
        assert_eq!(empty.high, Price::from("100.00"));
        assert_eq!(empty.low, Price::from("100.00"));
        assert_eq!(empty.close, Price::from("100.00"));
        assert_eq!(empty.volume, Quantity::zero(0));
    }

    #[rstest]
    #[should_panic]
    fn test_builder_build_without_updates_panics() {
        let mut builder = BarBuilder::new(bar_type(3, BarAggregation::Tick), 2, 0);
        let _ = builder.build_now();
    }

    #[rstest]
    fn test_builder_set_partial_applies_once() {
        let bt = bar_type(3, BarAggregation::Tick);
        let mut builder = BarBuilder::new(bt, 2, 0);

        let first = Bar::new(
            bt,
            Price::from("100.00"),
            Price::from("101.00"),
            Price::from("99.00"),
            Price::from("100.50"),
            Quantity::from(5_u64),
            UnixNanos::from(1_000),
            UnixNanos::from(1_000),
        );
        builder.set_partial(first);
        builder.set_partial(sample_bar(bt, "42.00", 9, 2_000)); // ignored

        let bar = builder.build_now();
        assert_eq!(bar.open, Price::from("100.00"));
        assert_eq!(bar.high, Price::from("101.00"));
        assert_eq!(bar.low, Price::from("99.00"));
        assert_eq!(bar.close, Price::from("100.50"));
        assert_eq!(bar.volume, Quantity::from(5_u64));
    }

    ////////////////////////////////////////////////////////////////////////////
    // Threshold aggregators
    ////////////////////////////////////////////////////////////////////////////

    #[rstest]
    fn test_tick_aggregator_builds_after_step_updates() {
        let (bars, handler) = collecting_handler();
        let mut aggregator = TickBarAggregator::new(bar_type(3, BarAggregation::Tick), 2, 0, handler);

        for i in 0..3 {
            aggregator.update(
                Price::from("100.00"),
                Quantity::from(1_u64),
                UnixNanos::from(1_000 * (i + 1)),
            );
        }

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, Quantity::from(3_u64));
    }

    #[rstest]
    fn test_tick_aggregator_counts_each_merged_bar_once() {
        let bt = bar_type(2, BarAggregation::Tick);
        let (bars, handler) = collecting_handler();
        let mut aggregator = TickBarAggregator::new(bt, 2, 0, handler);

        aggregator.handle_bar(sample_bar(bt, "100.00", 10, 1_000));
        assert!(bars.borrow().is_empty());
        aggregator.handle_bar(sample_bar(bt, "101.00", 10, 2_000));

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, Quantity::from(20_u64));
    }

    #[rstest]
    fn test_aggregator_set_partial_resumes_interrupted_window() {
        let bt = bar_type(3, BarAggregation::Tick);
        let (bars, handler) = collecting_handler();
        let mut aggregator = TickBarAggregator::new(bt, 2, 0, handler);

        let partial = Bar::new(
            bt,
            Price::from("100.00"),
            Price::from("101.00"),
            Price::from("99.00"),
            Price::from("100.50"),
            Quantity::from(5_u64),
            UnixNanos::from(1_000),
            UnixNanos::from(1_000),
        );
        aggregator.set_partial(partial);

        for i in 0..3 {
            aggregator.update(
                Price::from("102.00"),
                Quantity::from(1_u64),
                UnixNanos::from(2_000 + i * 1_000),
            );
        }

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, Price::from("100.00"));
        assert_eq!(bars[0].high, Price::from("102.00"));
        assert_eq!(bars[0].low, Price::from("99.00"));
        assert_eq!(bars[0].close, Price::from("102.00"));
        assert_eq!(bars[0].volume, Quantity::from(8_u64));
    }

    #[rstest]
    fn test_tick_aggregator_rejects_wrong_family() {
        let (_, handler) = collecting_handler();
        let result =
            TickBarAggregator::new_checked(bar_type(1, BarAggregation::Minute), 2, 0, handler);
        assert!(result.is_err());
    }

    #[rstest]
    fn test_volume_aggregator_conserves_size_across_splits() {
        let (bars, handler) = collecting_handler();
        let mut aggregator =
            VolumeBarAggregator::new(bar_type(10_000, BarAggregation::Volume), 2, 0, handler);

        let price = Price::from("100.00");
        aggregator.update(price, Quantity::from(3_000_u64), UnixNanos::from(1_000));
        aggregator.update(price, Quantity::from(4_000_u64), UnixNanos::from(2_000));
        aggregator.update(price, Quantity::from(25_000_u64), UnixNanos::from(3_000));

        {
            let bars = bars.borrow();
            assert_eq!(bars.len(), 3);
            for bar in bars.iter() {
                assert_eq!(bar.volume, Quantity::from(10_000_u64));
            }
        }

        // The 2000 remainder persists into the next window
        aggregator.update(price, Quantity::from(8_000_u64), UnixNanos::from(4_000));
        assert_eq!(bars.borrow().len(), 4);
        assert_eq!(bars.borrow()[3].volume, Quantity::from(10_000_u64));
    }

    #[rstest]
    fn test_volume_aggregator_splits_merged_bars() {
        let bt = bar_type(10_000, BarAggregation::Volume);
        let (bars, handler) = collecting_handler();
        let mut aggregator = VolumeBarAggregator::new(bt, 2, 0, handler);

        aggregator.handle_bar(sample_bar(bt, "100.00", 25_000, 1_000));

        let bars = bars.borrow();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].volume, Quantity::from(10_000_u64));
        assert_eq!(bars[1].volume, Quantity::from(10_000_u64));
    }

    #[rstest]
    fn test_value_aggregator_threshold_and_overshoot() {
        let (bars, handler) = collecting_handler();
        let mut aggregator =
            ValueBarAggregator::new(bar_type(1_000, BarAggregation::Value), 2, 0, handler);

        let price = Price::from("100.00");
        aggregator.update(price, Quantity::from(5_u64), UnixNanos::from(1_000));
        assert_eq!(aggregator.cumulative_value(), Decimal::from(500));
        assert!(bars.borrow().is_empty());

        // 8 * 100 = 800 crosses the 1000 threshold: the update splits, the
        // bar closes at exactly 1000 of notional, and the 300 remainder is
        // retained as the new cumulative
        aggregator.update(price, Quantity::from(8_u64), UnixNanos::from(2_000));
        assert_eq!(bars.borrow().len(), 1);
        assert_eq!(bars.borrow()[0].volume, Quantity::from(10_u64));
        assert_eq!(aggregator.cumulative_value(), Decimal::from(300));
    }

    #[rstest]
    fn test_value_aggregator_exact_threshold_resets_cumulative() {
        let (bars, handler) = collecting_handler();
        let mut aggregator =
            ValueBarAggregator::new(bar_type(1_000, BarAggregation::Value), 2, 0, handler);

        let price = Price::from("100.00");
        aggregator.update(price, Quantity::from(10_u64), UnixNanos::from(1_000));

        assert_eq!(bars.borrow().len(), 1);
        assert_eq!(bars.borrow()[0].volume, Quantity::from(10_u64));
        assert_eq!(aggregator.cumulative_value(), Decimal::ZERO);
    }

    #[rstest]
    fn test_threshold_aggregator_batch_mode_routes_to_batch_handler() {
        let (live_bars, live_handler) = collecting_handler();
        let mut aggregator =
            TickBarAggregator::new(bar_type(1, BarAggregation::Tick), 2, 0, live_handler);

        let (batch_bars, batch_handler) = collecting_handler();
        aggregator.start_batch_update(batch_handler, UnixNanos::default());
        aggregator.update(Price::from("100.00"), Quantity::from(1_u64), UnixNanos::from(1_000));

        assert!(live_bars.borrow().is_empty());
        assert_eq!(batch_bars.borrow().len(), 1);

        aggregator.stop_batch_update(UnixNanos::from(1_000));
        aggregator.update(Price::from("100.00"), Quantity::from(1_u64), UnixNanos::from(2_000));

        assert_eq!(live_bars.borrow().len(), 1);
        assert_eq!(batch_bars.borrow().len(), 1);
    }

    #[rstest]
    fn test_aggregation_is_deterministic() {
        let run = || {
            let (bars, handler) = collecting_handler();
            let mut aggregator =
                VolumeBarAggregator::new(bar_type(100, BarAggregation::Volume), 2, 0, handler);
            for i in 0..50_u64 {
                let price = Price::new(100.0 + (i % 7) as f64, 2);
                aggregator.update(price, Quantity::from(17_u64), UnixNanos::from(i * 1_000));
            }
            let result = bars.borrow().clone();
            result
        };

        let first = run();
        let second = run();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    ////////////////////////////////////////////////////////////////////////////
    // TimeBarAggregator
    ////////////////////////////////////////////////////////////////////////////

    type SharedTimeAggregator = Rc<RefCell<TimeBarAggregator<Box<dyn FnMut(Bar)>>>>;

    fn setup_time_aggregator(
        bar_type: BarType,
        config: &BarAggregationConfig,
        start_time_ns: u64,
    ) -> (SharedTimeAggregator, Rc<RefCell<TestClock>>, SharedBars) {
        let clock = Rc::new(RefCell::new(TestClock::new()));
        clock.borrow_mut().set_time(UnixNanos::from(start_time_ns));
        let clock_dyn: Rc<RefCell<dyn Clock>> = clock.clone();

        let (bars, handler) = collecting_handler();
        let aggregator = Rc::new(RefCell::new(
            TimeBarAggregator::new_checked(bar_type, 2, 0, clock_dyn, handler, config).unwrap(),
        ));
        aggregator
            .borrow_mut()
            .start(NewBarCallback::new(&aggregator))
            .unwrap();

        (aggregator, clock, bars)
    }

    fn fire_until(clock: &Rc<RefCell<TestClock>>, to_time_ns: u64) {
        let events = clock
            .borrow_mut()
            .advance_time(UnixNanos::from(to_time_ns), true);
        let handlers = clock.borrow().match_handlers(events);
        for handler in handlers {
            handler.run();
        }
    }

    fn minute_config() -> BarAggregationConfig {
        BarAggregationConfig::new(1, BarAggregation::Minute, PriceType::Last)
    }

    #[rstest]
    fn test_time_aggregator_snaps_to_grid() {
        // Clock at 90s into a 60s grid; first close must land on 120s
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, clock, bars) =
            setup_time_aggregator(bt, &minute_config(), 90 * 1_000_000_000);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(95 * 1_000_000_000),
        );
        fire_until(&clock, 2 * MINUTE_NS);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_event, 2 * MINUTE_NS);
        assert_eq!(bars[0].ts_init, 2 * MINUTE_NS);
    }

    #[rstest]
    fn test_time_aggregator_timestamp_on_open() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.timestamp_on_close = false;
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, 0);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(10_000_000_000),
        );
        fire_until(&clock, MINUTE_NS);
        aggregator.borrow_mut().update(
            Price::from("101.00"),
            Quantity::from(1_u64),
            UnixNanos::from(70_000_000_000),
        );
        fire_until(&clock, 2 * MINUTE_NS);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].ts_event, 0);
        assert_eq!(bars[0].ts_init, MINUTE_NS);
        assert_eq!(bars[1].ts_event, MINUTE_NS);
        assert_eq!(bars[1].ts_init, 2 * MINUTE_NS);
    }

    #[rstest]
    fn test_time_aggregator_right_open_timestamps_at_open() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.interval_type = BarIntervalType::RightOpen;
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, 0);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(10_000_000_000),
        );
        fire_until(&clock, MINUTE_NS);

        assert_eq!(bars.borrow()[0].ts_event, 0);
        assert_eq!(bars.borrow()[0].ts_init, MINUTE_NS);
    }

    #[rstest]
    fn test_time_aggregator_empty_interval_carries_close_forward() {
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &minute_config(), 0);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(5_u64),
            UnixNanos::from(10_000_000_000),
        );
        fire_until(&clock, MINUTE_NS);
        fire_until(&clock, 2 * MINUTE_NS); // no updates in the second interval

        let bars = bars.borrow();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].open, Price::from("100.00"));
        assert_eq!(bars[1].close, Price::from("100.00"));
        assert_eq!(bars[1].volume, Quantity::zero(0));
    }

    #[rstest]
    fn test_time_aggregator_no_build_with_no_updates() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.build_with_no_updates = false;
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, 0);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(5_u64),
            UnixNanos::from(10_000_000_000),
        );
        fire_until(&clock, MINUTE_NS);
        fire_until(&clock, 2 * MINUTE_NS);

        assert_eq!(bars.borrow().len(), 1);
    }

    #[rstest]
    fn test_time_aggregator_skips_first_non_full_bar() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.skip_first_non_full_bar = true;
        let (aggregator, clock, bars) =
            setup_time_aggregator(bt, &config, 90 * 1_000_000_000);

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(95 * 1_000_000_000),
        );
        fire_until(&clock, 2 * MINUTE_NS); // suppressed partial window

        aggregator.borrow_mut().update(
            Price::from("101.00"),
            Quantity::from(1_u64),
            UnixNanos::from(125 * 1_000_000_000),
        );
        fire_until(&clock, 3 * MINUTE_NS);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_event, 3 * MINUTE_NS);
        assert_eq!(bars[0].open, Price::from("101.00"));
    }

    #[rstest]
    fn test_time_aggregator_merges_composite_bars() {
        let composite = BarType::new_composite(
            InstrumentId::from("BTCUSDT.BINANCE"),
            BarSpecification::new(3, BarAggregation::Minute, PriceType::Last),
            AggregationSource::Internal,
            1,
            BarAggregation::Minute,
            AggregationSource::External,
        );
        let config = BarAggregationConfig::new(3, BarAggregation::Minute, PriceType::Last);
        let (aggregator, clock, bars) = setup_time_aggregator(composite, &config, 0);

        let input = composite.composite();
        let one_min = |open: &str, high: &str, low: &str, close: &str, ts: u64| {
            Bar::new(
                input,
                Price::from(open),
                Price::from(high),
                Price::from(low),
                Price::from(close),
                Quantity::from(10_u64),
                UnixNanos::from(ts),
                UnixNanos::from(ts),
            )
        };

        aggregator
            .borrow_mut()
            .handle_bar(one_min("100.00", "102.00", "99.00", "101.00", MINUTE_NS));
        aggregator
            .borrow_mut()
            .handle_bar(one_min("101.00", "105.00", "100.00", "104.00", 2 * MINUTE_NS));
        aggregator
            .borrow_mut()
            .handle_bar(one_min("104.00", "104.50", "98.00", "99.00", 3 * MINUTE_NS));
        fire_until(&clock, 3 * MINUTE_NS);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        let bar = bars[0];
        assert_eq!(bar.open, Price::from("100.00"));
        assert_eq!(bar.high, Price::from("105.00"));
        assert_eq!(bar.low, Price::from("98.00"));
        assert_eq!(bar.close, Price::from("99.00"));
        assert_eq!(bar.volume, Quantity::from(30_u64));
        assert_eq!(bar.ts_event, 3 * MINUTE_NS);
    }

    #[rstest]
    fn test_time_aggregator_monthly_schedule() {
        let bt = bar_type(1, BarAggregation::Month);
        let config = BarAggregationConfig::new(1, BarAggregation::Month, PriceType::Last);
        let start = UnixNanos::from(Utc.with_ymd_and_hms(2024, 7, 10, 0, 0, 0).unwrap());
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, start.as_u64());

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            start + 1_000_000_000,
        );

        let aug_first = UnixNanos::from(Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap());
        fire_until(&clock, aug_first.as_u64());

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_event, aug_first);

        // The next alert is calendar-resolved, one month out
        let sep_first = UnixNanos::from(Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap());
        assert_eq!(
            clock.borrow().next_time_ns(&aggregator.borrow().timer_name),
            Some(sep_first)
        );
    }

    #[rstest]
    fn test_time_aggregator_batch_replay_emits_on_grid() {
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, _clock, live_bars) = setup_time_aggregator(bt, &minute_config(), 0);

        let (batch_bars, batch_handler) = collecting_handler();
        aggregator
            .borrow_mut()
            .start_batch_update(batch_handler, UnixNanos::from(MINUTE_NS));

        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(70_000_000_000),
        );
        aggregator.borrow_mut().update(
            Price::from("101.00"),
            Quantity::from(1_u64),
            UnixNanos::from(2 * MINUTE_NS),
        );

        assert!(live_bars.borrow().is_empty());
        let batch = batch_bars.borrow();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].ts_event, 2 * MINUTE_NS);
        assert_eq!(batch[0].open, Price::from("100.00"));
        assert_eq!(batch[0].close, Price::from("101.00"));
    }

    #[rstest]
    fn test_time_aggregator_stop_batch_clears_elapsed_boundary() {
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, _clock, _bars) = setup_time_aggregator(bt, &minute_config(), 0);

        let (_batch_bars, batch_handler) = collecting_handler();
        aggregator
            .borrow_mut()
            .start_batch_update(batch_handler, UnixNanos::from(MINUTE_NS));

        // The pending 60s boundary was the batch's to emit; resuming live at
        // 70s must not replay it through the live handler
        aggregator
            .borrow_mut()
            .stop_batch_update(UnixNanos::from(70_000_000_000));

        assert!(aggregator.borrow().batch_next_close_ns.is_zero());
        assert_eq!(aggregator.borrow().core.mode(), AggregationMode::Live);
    }

    #[rstest]
    fn test_time_aggregator_stop_batch_keeps_future_boundary() {
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, _clock, _bars) = setup_time_aggregator(bt, &minute_config(), 0);

        let (_batch_bars, batch_handler) = collecting_handler();
        aggregator
            .borrow_mut()
            .start_batch_update(batch_handler, UnixNanos::from(MINUTE_NS));
        aggregator
            .borrow_mut()
            .stop_batch_update(UnixNanos::from(30_000_000_000));

        assert_eq!(
            aggregator.borrow().batch_next_close_ns,
            UnixNanos::from(MINUTE_NS)
        );
        assert_eq!(aggregator.borrow().core.mode(), AggregationMode::Live);
    }

    #[rstest]
    fn test_time_aggregator_rejects_threshold_family() {
        let clock: Rc<RefCell<dyn Clock>> = Rc::new(RefCell::new(TestClock::new()));
        let (_, handler) = collecting_handler();
        let config = BarAggregationConfig::new(100, BarAggregation::Tick, PriceType::Last);
        let result = TimeBarAggregator::new_checked(
            bar_type(100, BarAggregation::Tick),
            2,
            0,
            clock,
            handler,
            &config,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_time_aggregator_rejects_disagreeing_config_spec() {
        let clock: Rc<RefCell<dyn Clock>> = Rc::new(RefCell::new(TestClock::new()));
        let (_, handler) = collecting_handler();
        let config = BarAggregationConfig::new(5, BarAggregation::Minute, PriceType::Last);
        let result = TimeBarAggregator::new_checked(
            bar_type(1, BarAggregation::Minute),
            2,
            0,
            clock,
            handler,
            &config,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_time_aggregator_rejects_oversized_origin_offset() {
        let clock: Rc<RefCell<dyn Clock>> = Rc::new(RefCell::new(TestClock::new()));
        let (_, handler) = collecting_handler();
        let mut config = minute_config();
        config.time_bars_origin_offset_ns = Some(MINUTE_NS as i64);
        let result = TimeBarAggregator::new_checked(
            bar_type(1, BarAggregation::Minute),
            2,
            0,
            clock,
            handler,
            &config,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_time_aggregator_origin_offset_shifts_grid() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.time_bars_origin_offset_ns = Some(30_000_000_000);
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, 45 * 1_000_000_000);

        // Grid runs at :30 boundaries; the window containing 45s closes at 90s
        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(50 * 1_000_000_000),
        );
        fire_until(&clock, 90 * 1_000_000_000);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_event, 90 * 1_000_000_000);
    }

    #[rstest]
    fn test_time_aggregator_negative_origin_offset_shifts_grid() {
        let bt = bar_type(1, BarAggregation::Minute);
        let mut config = minute_config();
        config.time_bars_origin_offset_ns = Some(-20_000_000_000);
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &config, 45 * 1_000_000_000);

        // Grid runs at :40 boundaries; the window containing 45s closes at 100s
        aggregator.borrow_mut().update(
            Price::from("100.00"),
            Quantity::from(1_u64),
            UnixNanos::from(50 * 1_000_000_000),
        );
        fire_until(&clock, 100 * 1_000_000_000);

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts_event, 100 * 1_000_000_000);
    }

    #[rstest]
    fn test_time_aggregator_stop_cancels_timer() {
        let bt = bar_type(1, BarAggregation::Minute);
        let (aggregator, clock, bars) = setup_time_aggregator(bt, &minute_config(), 0);

        aggregator.borrow_mut().stop();
        assert_eq!(clock.borrow().timer_count(), 0);

        fire_until(&clock, 5 * MINUTE_NS);
        assert!(bars.borrow().is_empty());
    }

    #[rstest]
    fn test_handle_event_dispatches_by_kind() {
        let mid_bar_type = BarType::new(
            InstrumentId::from("AUD/USD.SIM"),
            BarSpecification::new(2, BarAggregation::Tick, PriceType::Mid),
            AggregationSource::Internal,
        );
        let (bars, handler) = collecting_handler();
        let mut aggregator = TickBarAggregator::new(mid_bar_type, 5, 0, handler);

        aggregator.handle_event(MarketEvent::from(TradeTick::default()));
        assert!(bars.borrow().is_empty());
        aggregator.handle_event(MarketEvent::from(QuoteTick::default()));

        let bars = bars.borrow();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, Quantity::from(200_000_u64));
    }
}
