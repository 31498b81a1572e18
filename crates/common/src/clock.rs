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

//! `Clock` abstraction and the manually-advanced `TestClock` implementation.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
};

use barflow_core::{
    UnixNanos,
    correctness::{check_positive_u64, check_predicate_true, check_valid_string},
};
use chrono::{DateTime, Utc};
use ustr::Ustr;

use crate::timer::{TestTimer, TimeEvent, TimeEventCallback, TimeEventHandler, create_valid_interval};

/// A source of time and named timers for driving time-based aggregation.
///
/// An active timer is one which has not expired.
pub trait Clock: Debug {
    /// Returns the current UNIX timestamp in nanoseconds.
    fn timestamp_ns(&self) -> UnixNanos;

    /// Returns the current date and time as a timezone-aware `DateTime<Utc>`.
    fn utc_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns().as_i64())
    }

    /// Returns the names of active timers in the clock.
    fn timer_names(&self) -> Vec<&str>;

    /// Returns the count of active timers in the clock.
    fn timer_count(&self) -> usize;

    /// Registers a default event handler for the clock. Timers set without
    /// their own callback use this handler.
    fn register_default_handler(&mut self, callback: TimeEventCallback);

    /// Sets a timer to alert once at the specified time.
    ///
    /// When `alert_time_ns` is already past, the alert fires at the current
    /// time if `allow_past` is `true` (the default), otherwise this is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is invalid, no callback is available, or
    /// the alert time is in the past when `allow_past` is `false`.
    fn set_time_alert_ns(
        &mut self,
        name: &str,
        alert_time_ns: UnixNanos,
        callback: Option<TimeEventCallback>,
        allow_past: Option<bool>,
    ) -> anyhow::Result<()>;

    /// Sets a timer to fire time events at every interval between the start
    /// and optional stop time.
    ///
    /// | `allow_past` | `fire_immediately` | Behavior                                                                 |
    /// |--------------|--------------------|--------------------------------------------------------------------------|
    /// | `true`       | `true`             | First event fires at the start time, even if that is in the past.        |
    /// | `true`       | `false`            | First event fires at start + interval, even if that is in the past.      |
    /// | `false`      | `true`             | Error if the start time is in the past.                                  |
    /// | `false`      | `false`            | Error if start + interval is in the past.                                |
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is invalid, `interval_ns` is not positive,
    /// no callback is available, or a time predicate fails.
    #[allow(clippy::too_many_arguments)]
    fn set_timer_ns(
        &mut self,
        name: &str,
        interval_ns: u64,
        start_time_ns: UnixNanos,
        stop_time_ns: Option<UnixNanos>,
        callback: Option<TimeEventCallback>,
        allow_past: Option<bool>,
        fire_immediately: Option<bool>,
    ) -> anyhow::Result<()>;

    /// Returns the next time at which the timer `name` will fire, or `None`
    /// if no such timer exists.
    fn next_time_ns(&self, name: &str) -> Option<UnixNanos>;

    /// Cancels the timer with `name`.
    fn cancel_timer(&mut self, name: &str);

    /// Cancels all timers.
    fn cancel_timers(&mut self);

    /// Resets the clock by clearing its internal state.
    fn reset(&mut self);
}

/// A manually-advanced clock.
///
/// Stores the current timestamp internally, which is advanced by the driver
/// of a batch replay or a test. Advancing the clock yields the time events of
/// every timer boundary crossed, in deterministic order.
#[derive(Debug)]
pub struct TestClock {
    time_ns: UnixNanos,
    // BTreeMap gives stable ordering when scanning timers in `advance_time`
    timers: BTreeMap<Ustr, TestTimer>,
    default_callback: Option<TimeEventCallback>,
    callbacks: HashMap<Ustr, TimeEventCallback>,
}

impl TestClock {
    /// Creates a new [`TestClock`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            time_ns: UnixNanos::default(),
            timers: BTreeMap::new(),
            default_callback: None,
            callbacks: HashMap::new(),
        }
    }

    /// Returns a reference to the internal timers for the clock.
    #[must_use]
    pub const fn get_timers(&self) -> &BTreeMap<Ustr, TestTimer> {
        &self.timers
    }

    /// Sets the internal clock to the given time without advancing timers.
    pub fn set_time(&mut self, to_time_ns: UnixNanos) {
        self.time_ns = to_time_ns;
    }

    /// Advances the internal clock to `to_time_ns` and returns the time
    /// events generated by every timer boundary crossed, sorted by their
    /// event timestamp.
    ///
    /// If `set_time` is `true` the internal clock is updated to `to_time_ns`,
    /// otherwise only the timers advance.
    ///
    /// # Panics
    ///
    /// Panics if `to_time_ns` is less than the current internal clock time.
    pub fn advance_time(&mut self, to_time_ns: UnixNanos, set_time: bool) -> Vec<TimeEvent> {
        // Time must be non-decreasing
        assert!(
            to_time_ns >= self.time_ns,
            "`to_time_ns` {to_time_ns} was < `self.time_ns` {}",
            self.time_ns
        );

        if set_time {
            self.time_ns = to_time_ns;
        }

        // Advance timers, collect events, and retain only alive timers
        let mut events: Vec<TimeEvent> = Vec::new();
        self.timers.retain(|_, timer| {
            events.extend(timer.advance(to_time_ns));
            !timer.is_expired()
        });

        events.sort_by_key(|event| event.ts_event);
        events
    }

    /// Matches time events with their corresponding handlers.
    ///
    /// # Panics
    ///
    /// Panics if an event has no specific callback and no default callback
    /// is registered.
    #[must_use]
    pub fn match_handlers(&self, events: Vec<TimeEvent>) -> Vec<TimeEventHandler> {
        events
            .into_iter()
            .map(|event| {
                let callback = self.callbacks.get(&event.name).cloned().unwrap_or_else(|| {
                    self.default_callback
                        .clone()
                        .expect("Default callback should exist")
                });
                TimeEventHandler::new(event, callback)
            })
            .collect()
    }
}

impl Default for TestClock {
    /// Creates a new default [`TestClock`] instance.
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn timestamp_ns(&self) -> UnixNanos {
        self.time_ns
    }

    fn timer_names(&self) -> Vec<&str> {
        self.timers
            .iter()
            .filter(|(_, timer)| !timer.is_expired())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    fn timer_count(&self) -> usize {
        self.timers
            .values()
            .filter(|timer| !timer.is_expired())
            .count()
    }

    fn register_default_handler(&mut self, callback: TimeEventCallback) {
        self.default_callback = Some(callback);
    }

    fn set_time_alert_ns(
        &mut self,
        name: &str,
        mut alert_time_ns: UnixNanos,
        callback: Option<TimeEventCallback>,
        allow_past: Option<bool>,
    ) -> anyhow::Result<()> {
        check_valid_string(name, stringify!(name))?;

        let name = Ustr::from(name);
        let allow_past = allow_past.unwrap_or(true);

        check_predicate_true(
            callback.is_some()
                || self.callbacks.contains_key(&name)
                || self.default_callback.is_some(),
            "No callbacks provided",
        )?;

        if let Some(callback) = callback {
            self.callbacks.insert(name, callback);
        }

        // Allows reusing a time alert without re-registering the callback,
        // for example for irregular monthly alerts
        self.cancel_timer(name.as_str());

        let ts_now = self.time_ns;

        if alert_time_ns < ts_now {
            if allow_past {
                alert_time_ns = ts_now;
                log::warn!(
                    "Timer '{name}' alert time {} was in the past, adjusted to current time for immediate firing",
                    alert_time_ns.to_rfc3339(),
                );
            } else {
                anyhow::bail!(
                    "Timer '{name}' alert time {} was in the past (current time is {})",
                    alert_time_ns.to_rfc3339(),
                    ts_now.to_rfc3339(),
                );
            }
        }

        let interval_ns = create_valid_interval((alert_time_ns - ts_now).into());
        let timer = TestTimer::new(name, interval_ns, ts_now, Some(alert_time_ns), false);
        self.timers.insert(name, timer);

        Ok(())
    }

    fn set_timer_ns(
        &mut self,
        name: &str,
        interval_ns: u64,
        start_time_ns: UnixNanos,
        stop_time_ns: Option<UnixNanos>,
        callback: Option<TimeEventCallback>,
        allow_past: Option<bool>,
        fire_immediately: Option<bool>,
    ) -> anyhow::Result<()> {
        check_valid_string(name, stringify!(name))?;
        check_positive_u64(interval_ns, stringify!(interval_ns))?;
        check_predicate_true(
            callback.is_some() || self.default_callback.is_some(),
            "No callbacks provided",
        )?;

        let name = Ustr::from(name);
        let allow_past = allow_past.unwrap_or(true);
        let fire_immediately = fire_immediately.unwrap_or(false);

        if let Some(callback) = callback {
            self.callbacks.insert(name, callback);
        }

        let mut start_time_ns = start_time_ns;
        let ts_now = self.time_ns;

        if start_time_ns.is_zero() {
            // Zero indicates no explicit start; use the current time
            start_time_ns = ts_now;
        } else if !allow_past {
            let next_event_time = if fire_immediately {
                start_time_ns
            } else {
                start_time_ns + interval_ns
            };

            if next_event_time < ts_now {
                anyhow::bail!(
                    "Timer '{name}' next event time {} would be in the past (current time is {})",
                    next_event_time.to_rfc3339(),
                    ts_now.to_rfc3339(),
                );
            }
        }

        if let Some(stop_time_ns) = stop_time_ns {
            if stop_time_ns <= start_time_ns {
                anyhow::bail!(
                    "Timer '{name}' stop time {} must be after start time {}",
                    stop_time_ns.to_rfc3339(),
                    start_time_ns.to_rfc3339(),
                );
            }
        }

        let interval_ns = create_valid_interval(interval_ns);
        let timer = TestTimer::new(name, interval_ns, start_time_ns, stop_time_ns, fire_immediately);
        self.timers.insert(name, timer);

        Ok(())
    }

    fn next_time_ns(&self, name: &str) -> Option<UnixNanos> {
        self.timers
            .get(&Ustr::from(name))
            .map(TestTimer::next_time_ns)
    }

    fn cancel_timer(&mut self, name: &str) {
        if let Some(mut timer) = self.timers.remove(&Ustr::from(name)) {
            timer.cancel();
        }
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.values_mut() {
            timer.cancel();
        }
        self.timers.clear();
    }

    fn reset(&mut self) {
        self.time_ns = UnixNanos::default();
        self.timers.clear();
        self.callbacks.clear();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn clock() -> TestClock {
        let mut clock = TestClock::new();
        clock.register_default_handler(TimeEventCallback::from(|_: TimeEvent| {}));
        clock
    }

    #[rstest]
    fn test_set_timer_and_advance(mut clock: TestClock) {
        clock
            .set_timer_ns("timer-1", 10, UnixNanos::default(), None, None, None, None)
            .unwrap();
        assert_eq!(clock.timer_count(), 1);
        assert_eq!(clock.timer_names(), vec!["timer-1"]);

        let events = clock.advance_time(UnixNanos::from(35), true);
        assert_eq!(events.len(), 3);
        assert_eq!(clock.timestamp_ns(), 35);
        assert_eq!(clock.next_time_ns("timer-1"), Some(UnixNanos::from(40)));
    }

    #[rstest]
    fn test_advance_time_events_are_ordered(mut clock: TestClock) {
        clock
            .set_timer_ns("timer-a", 7, UnixNanos::default(), None, None, None, None)
            .unwrap();
        clock
            .set_timer_ns("timer-b", 5, UnixNanos::default(), None, None, None, None)
            .unwrap();

        let events = clock.advance_time(UnixNanos::from(20), true);
        let ts: Vec<u64> = events.iter().map(|e| e.ts_event.as_u64()).collect();
        assert_eq!(ts, vec![5, 7, 10, 14, 15, 20]);
    }

    #[rstest]
    fn test_timer_with_stop_time_expires(mut clock: TestClock) {
        clock
            .set_timer_ns(
                "timer-1",
                10,
                UnixNanos::default(),
                Some(UnixNanos::from(30)),
                None,
                None,
                None,
            )
            .unwrap();

        let events = clock.advance_time(UnixNanos::from(100), true);
        assert_eq!(events.len(), 3);
        assert_eq!(clock.timer_count(), 0);
    }

    #[rstest]
    fn test_set_time_alert_fires_once(mut clock: TestClock) {
        clock
            .set_time_alert_ns("alert-1", UnixNanos::from(50), None, None)
            .unwrap();

        let events = clock.advance_time(UnixNanos::from(100), true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ts_event, 50);
        assert_eq!(clock.timer_count(), 0);
    }

    #[rstest]
    fn test_set_time_alert_in_past_errors_when_disallowed(mut clock: TestClock) {
        clock.set_time(UnixNanos::from(100));
        let result = clock.set_time_alert_ns("alert-1", UnixNanos::from(50), None, Some(false));
        assert!(result.is_err());
    }

    #[rstest]
    fn test_set_timer_requires_callback() {
        let mut clock = TestClock::new();
        let result =
            clock.set_timer_ns("timer-1", 10, UnixNanos::default(), None, None, None, None);
        assert!(result.is_err());
    }

    #[rstest]
    fn test_match_handlers_invokes_specific_callback(mut clock: TestClock) {
        let fired: Rc<RefCell<Vec<UnixNanos>>> = Rc::new(RefCell::new(Vec::new()));
        let fired_clone = fired.clone();
        let callback = TimeEventCallback::from(move |event: TimeEvent| {
            fired_clone.borrow_mut().push(event.ts_event);
        });

        clock
            .set_timer_ns(
                "timer-1",
                10,
                UnixNanos::default(),
                None,
                Some(callback),
                None,
                None,
            )
            .unwrap();

        let events = clock.advance_time(UnixNanos::from(20), true);
        for handler in clock.match_handlers(events) {
            handler.run();
        }

        assert_eq!(*fired.borrow(), vec![UnixNanos::from(10), UnixNanos::from(20)]);
    }

    #[rstest]
    fn test_cancel_timer(mut clock: TestClock) {
        clock
            .set_timer_ns("timer-1", 10, UnixNanos::default(), None, None, None, None)
            .unwrap();
        clock.cancel_timer("timer-1");
        assert_eq!(clock.timer_count(), 0);
        assert!(clock.advance_time(UnixNanos::from(100), true).is_empty());
    }
}
