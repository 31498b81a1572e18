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

//! Timers and time events for use with `Clock` implementations.

use std::{
    fmt::{Debug, Display},
    num::NonZeroU64,
    rc::Rc,
};

use barflow_core::{
    UnixNanos,
    correctness::{FAILED, check_valid_string},
};
use ustr::Ustr;

/// Creates a valid nanoseconds interval that is guaranteed to be positive.
#[must_use]
pub fn create_valid_interval(interval_ns: u64) -> NonZeroU64 {
    NonZeroU64::new(std::cmp::max(interval_ns, 1)).expect("`interval_ns` must be positive")
}

/// Represents a time event occurring at the event timestamp.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeEvent {
    /// The event name, identifying the timer which generated the event.
    pub name: Ustr,
    /// UNIX timestamp (nanoseconds) when the event occurred.
    pub ts_event: UnixNanos,
    /// UNIX timestamp (nanoseconds) when the instance was initialized.
    pub ts_init: UnixNanos,
}

impl TimeEvent {
    /// Creates a new [`TimeEvent`] instance.
    #[must_use]
    pub const fn new(name: Ustr, ts_event: UnixNanos, ts_init: UnixNanos) -> Self {
        Self {
            name,
            ts_event,
            ts_init,
        }
    }
}

impl Display for TimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TimeEvent(name={}, ts_event={}, ts_init={})",
            self.name, self.ts_event, self.ts_init
        )
    }
}

/// A shareable handler invoked when a [`TimeEvent`] fires.
#[derive(Clone)]
pub struct TimeEventCallback(Rc<dyn Fn(TimeEvent)>);

impl TimeEventCallback {
    /// Invokes the callback with `event`.
    pub fn call(&self, event: TimeEvent) {
        (self.0)(event);
    }
}

impl Debug for TimeEventCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TimeEventCallback")
    }
}

impl<F: Fn(TimeEvent) + 'static> From<F> for TimeEventCallback {
    fn from(value: F) -> Self {
        Self(Rc::new(value))
    }
}

impl From<Rc<dyn Fn(TimeEvent)>> for TimeEventCallback {
    fn from(value: Rc<dyn Fn(TimeEvent)>) -> Self {
        Self(value)
    }
}

/// A time event paired with the handler to invoke for it.
#[derive(Clone, Debug)]
pub struct TimeEventHandler {
    /// The time event.
    pub event: TimeEvent,
    /// The callable handler for the event.
    pub callback: TimeEventCallback,
}

impl TimeEventHandler {
    /// Creates a new [`TimeEventHandler`] instance.
    #[must_use]
    pub const fn new(event: TimeEvent, callback: TimeEventCallback) -> Self {
        Self { event, callback }
    }

    /// Consumes the handler, invoking the callback with the event.
    pub fn run(self) {
        let Self { event, callback } = self;
        callback.call(event);
    }
}

/// A timer advanced manually by a `TestClock`.
///
/// Generates a deterministic sequence of [`TimeEvent`]s at each interval
/// boundary between its start and optional stop time.
#[derive(Clone, Copy, Debug)]
pub struct TestTimer {
    /// The name of the timer.
    pub name: Ustr,
    /// The interval between timer events in nanoseconds.
    pub interval_ns: NonZeroU64,
    /// The start time of the timer in UNIX nanoseconds.
    pub start_time_ns: UnixNanos,
    /// The optional stop time of the timer in UNIX nanoseconds.
    pub stop_time_ns: Option<UnixNanos>,
    next_time_ns: UnixNanos,
    is_expired: bool,
}

impl TestTimer {
    /// Creates a new [`TestTimer`] instance.
    ///
    /// When `fire_immediately` is `true` the first event fires at the start
    /// time itself rather than one interval after it.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid string.
    #[must_use]
    pub fn new(
        name: Ustr,
        interval_ns: NonZeroU64,
        start_time_ns: UnixNanos,
        stop_time_ns: Option<UnixNanos>,
        fire_immediately: bool,
    ) -> Self {
        check_valid_string(name.as_str(), stringify!(name)).expect(FAILED);

        let next_time_ns = if fire_immediately {
            start_time_ns
        } else {
            start_time_ns + interval_ns.get()
        };

        Self {
            name,
            interval_ns,
            start_time_ns,
            stop_time_ns,
            next_time_ns,
            is_expired: false,
        }
    }

    /// Returns the next time in UNIX nanoseconds when the timer will fire.
    #[must_use]
    pub const fn next_time_ns(&self) -> UnixNanos {
        self.next_time_ns
    }

    /// Returns whether the timer is expired.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        self.is_expired
    }

    /// Advances the timer to `to_time_ns`, yielding an event for every
    /// interval boundary at or before that time.
    pub fn advance(&mut self, to_time_ns: UnixNanos) -> impl Iterator<Item = TimeEvent> + '_ {
        let advances = if to_time_ns < self.next_time_ns {
            0
        } else {
            (to_time_ns.as_u64() - self.next_time_ns.as_u64()) / self.interval_ns.get() + 1
        };
        self.take(advances as usize)
    }

    /// Cancels the timer (it will generate no further events).
    pub const fn cancel(&mut self) {
        self.is_expired = true;
    }
}

impl Iterator for TestTimer {
    type Item = TimeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_expired {
            return None;
        }

        let event = TimeEvent {
            name: self.name,
            ts_event: self.next_time_ns,
            ts_init: self.next_time_ns,
        };

        // Expire once the stop time has been reached
        if let Some(stop_time_ns) = self.stop_time_ns {
            if self.next_time_ns >= stop_time_ns {
                self.is_expired = true;
            }
        }

        self.next_time_ns += self.interval_ns.get();

        Some(event)
    }
}
