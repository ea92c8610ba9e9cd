// Handle aggregation: pooled event-loop workers multiplexing many pollable handles.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Adaptive pacing of periodic work against a drift-free wall-clock schedule.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// Wall-clock moment in microseconds since the UNIX epoch.
///
/// Unlike [`std::time::Instant`] this may go backwards when the host clock is adjusted, which is
/// exactly what [`PacingTimer`] has to cope with.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default, Display)]
#[display(inner)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        Self(micros(duration))
    }

    pub fn from_micros(micros: u64) -> Self { Self(micros) }

    /// Converts into number of microseconds since UNIX epoch.
    pub fn into_micros(self) -> u64 { self.0 }

    /// Signed distance from `earlier` to `self`, in microseconds, saturating at `±i64::MAX`.
    pub fn micros_since(self, earlier: Timestamp) -> i64 {
        let distance = self.0 as i128 - earlier.0 as i128;
        distance.clamp(-(i64::MAX as i128), i64::MAX as i128) as i64
    }
}

/// Whole microseconds of `duration`, saturating at `u64::MAX`.
fn micros(duration: Duration) -> u64 { u64::try_from(duration.as_micros()).unwrap_or(u64::MAX) }

/// Whole microseconds of `duration`, saturating at `i64::MAX`.
fn signed_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0.saturating_add(micros(rhs))) }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_sub(micros(rhs)))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 = self.0.saturating_add(micros(rhs)) }
}

/// Source of wall-clock time and of blocking sleeps.
pub trait Clock {
    fn now(&self) -> Timestamp;
    fn sleep(&self, duration: Duration);
}

/// Host wall clock with [`thread::sleep`].
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp { Timestamp::now() }
    fn sleep(&self, duration: Duration) { thread::sleep(duration) }
}

/// Clock which moves only when told to.
///
/// Sleeping advances the clock by the requested duration plus a configurable oversleep. Clones
/// share the same time, so a test may keep one copy and hand another to a [`PacingTimer`].
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    oversleep: Arc<AtomicU64>,
    slept: Arc<AtomicU64>,
    sleeps: Arc<AtomicUsize>,
}

impl ManualClock {
    pub fn starting_at(start: Timestamp) -> Self {
        let clock = ManualClock::default();
        clock.set(start);
        clock
    }

    pub fn set(&self, time: Timestamp) { self.now.store(time.0, Ordering::SeqCst) }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(micros(by), Ordering::SeqCst);
    }

    /// Moves the clock backwards, as when the host time gets corrected.
    pub fn rewind(&self, by: Duration) {
        let by = micros(by);
        let _ = self.now.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
            Some(now.saturating_sub(by))
        });
    }

    /// Every subsequent sleep overshoots by `extra`.
    pub fn set_oversleep(&self, extra: Duration) {
        self.oversleep.store(micros(extra), Ordering::SeqCst)
    }

    /// Total time requested through [`Clock::sleep`].
    pub fn slept(&self) -> Duration { Duration::from_micros(self.slept.load(Ordering::SeqCst)) }

    /// Number of [`Clock::sleep`] calls.
    pub fn sleeps(&self) -> usize { self.sleeps.load(Ordering::SeqCst) }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp { Timestamp(self.now.load(Ordering::SeqCst)) }

    fn sleep(&self, duration: Duration) {
        let micros = micros(duration);
        self.slept.fetch_add(micros, Ordering::SeqCst);
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.now.fetch_add(micros.saturating_add(self.oversleep.load(Ordering::SeqCst)), Ordering::SeqCst);
    }
}

/// Outcome of a single [`PacingTimer::delay_interval`] call.
///
/// None of the outcomes is an error for the paced operation; they are reported for
/// instrumentation only.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(doc_comments)]
pub enum Pace {
    /// on schedule
    OnTime,

    /// behind schedule by {0:?}; no sleep performed
    Late(Duration),

    /// schedule slipped and was resynchronized, dropping {0} interval(s)
    Slipped(u64),

    /// sleep overran the requested duration by {0:?}
    OverSlept(Duration),

    /// pacing interval must be non-zero
    BadDelta,
}

impl Pace {
    pub fn is_on_schedule(self) -> bool { matches!(self, Pace::OnTime) }
}

/// Keeps a periodic operation on an ideal schedule `start + Σ delta`.
///
/// Each [`PacingTimer::delay_interval`] call moves the target forward by the given interval and
/// sleeps until the target is reached, so time lost to the work done between calls is
/// compensated by shorter sleeps. The schedule is re-established from the current moment when the
/// host clock jumps backwards, or when the caller falls more than `max_slip` behind.
#[derive(Debug)]
pub struct PacingTimer<C: Clock = SystemClock> {
    clock: C,
    target: Timestamp,
    first_time: bool,
    max_slip: Option<Duration>,
    min_delay: Duration,
}

impl PacingTimer<SystemClock> {
    /// Creates pacing timer running on the host clock.
    ///
    /// `max_slip` of `None` disables resynchronization: a late caller gets [`Pace::Late`] and
    /// catches up by skipping sleeps. Sleeps shorter than `min_delay` are not performed.
    pub fn new(max_slip: Option<Duration>, min_delay: Duration) -> Self {
        PacingTimer::with_clock(SystemClock, max_slip, min_delay)
    }
}

impl Default for PacingTimer<SystemClock> {
    fn default() -> Self { PacingTimer::new(None, Duration::ZERO) }
}

impl<C: Clock> PacingTimer<C> {
    pub fn with_clock(clock: C, max_slip: Option<Duration>, min_delay: Duration) -> Self {
        PacingTimer {
            clock,
            target: Timestamp::default(),
            first_time: true,
            max_slip,
            min_delay,
        }
    }

    /// Forgets the schedule; the next call starts a new one from its own moment.
    pub fn restart(&mut self) { self.first_time = true; }

    /// Scheduled moment of the last interval, or `None` before the schedule is established.
    pub fn target(&self) -> Option<Timestamp> {
        if self.first_time {
            None
        } else {
            Some(self.target)
        }
    }

    pub fn clock(&self) -> &C { &self.clock }

    /// Waits until the next point of the schedule, `delta` after the previous one.
    ///
    /// # Blocking
    ///
    /// Blocks the calling thread for up to `delta` (longer if the clock was moved backwards by
    /// less than `delta`).
    pub fn delay_interval(&mut self, delta: Duration) -> Pace {
        if delta.is_zero() {
            return Pace::BadDelta;
        }

        let now = self.clock.now();
        if self.first_time {
            self.first_time = false;
            self.target = now;
        } else if self.target > now + delta {
            #[cfg(feature = "log")]
            log::warn!(target: "pacing", "Clock moved backwards (target {} is ahead of now {now} by more than {delta:?}); resynchronizing", self.target);
            self.target = now;
        }

        self.target += delta;

        let delta_us = signed_micros(delta);
        let sleep_us = self.target.micros_since(now);

        if let Some(max_slip) = self.max_slip {
            if sleep_us < -signed_micros(max_slip) {
                let dropped = (-sleep_us / delta_us) as u64;
                #[cfg(feature = "log")]
                log::warn!(target: "pacing", "Schedule slipped by {}us, dropping {dropped} interval(s)", -sleep_us);
                self.target = now;
                return Pace::Slipped(dropped);
            }
        }

        if sleep_us <= 0 || sleep_us < signed_micros(self.min_delay) {
            return if sleep_us < 0 {
                #[cfg(feature = "log")]
                log::trace!(target: "pacing", "Running {}us late", -sleep_us);
                Pace::Late(Duration::from_micros(-sleep_us as u64))
            } else {
                Pace::OnTime
            };
        }

        let sleep_for = Duration::from_micros(sleep_us as u64);
        self.clock.sleep(sleep_for);

        let elapsed_us = self.clock.now().micros_since(now);
        if elapsed_us > sleep_us.saturating_add(delta_us.saturating_mul(2)) {
            let over = Duration::from_micros((elapsed_us - sleep_us) as u64);
            #[cfg(feature = "log")]
            log::debug!(target: "pacing", "Overslept by {over:?} after requesting {sleep_for:?}");
            return Pace::OverSlept(over);
        }

        Pace::OnTime
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const START: u64 = 1_700_000_000_000_000;

    fn timer(max_slip: Option<Duration>) -> (ManualClock, PacingTimer<ManualClock>) {
        let clock = ManualClock::starting_at(Timestamp::from_micros(START));
        let timer = PacingTimer::with_clock(clock.clone(), max_slip, Duration::ZERO);
        (clock, timer)
    }

    #[test]
    fn zero_delta() {
        let (clock, mut timer) = timer(None);
        assert_eq!(timer.delay_interval(Duration::ZERO), Pace::BadDelta);
        assert_eq!(timer.target(), None);
        assert_eq!(clock.sleeps(), 0);
    }

    #[test]
    fn drift_free_schedule() {
        let d = Duration::from_millis(20);
        let (clock, mut timer) = timer(None);

        for _ in 0..50 {
            assert_eq!(timer.delay_interval(d), Pace::OnTime);
        }
        assert_eq!(timer.target(), Some(Timestamp::from_micros(START) + d * 50));
        assert_eq!(clock.now(), Timestamp::from_micros(START) + d * 50);
        assert_eq!(clock.slept(), d * 50);
    }

    #[test]
    fn work_between_calls_is_compensated() {
        let d = Duration::from_millis(20);
        let (clock, mut timer) = timer(None);

        for _ in 0..10 {
            clock.advance(Duration::from_millis(15));
            assert_eq!(timer.delay_interval(d), Pace::OnTime);
        }
        // First call starts the schedule after the first 15ms of work.
        let start = Timestamp::from_micros(START) + Duration::from_millis(15);
        assert_eq!(timer.target(), Some(start + d * 10));
        assert_eq!(clock.now(), start + d * 10);
    }

    #[test]
    fn late_without_slip_limit() {
        let d = Duration::from_millis(10);
        let (clock, mut timer) = timer(None);

        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        clock.advance(d * 3);
        let sleeps = clock.sleeps();
        assert_eq!(timer.delay_interval(d), Pace::Late(d * 2));
        assert_eq!(clock.sleeps(), sleeps);
        // Catching up: target is still behind, no sleep either.
        assert_eq!(timer.delay_interval(d), Pace::Late(d));
        assert_eq!(timer.delay_interval(d), Pace::OnTime);
    }

    #[test]
    fn slip_resynchronizes() {
        let d = Duration::from_millis(10);
        let (clock, mut timer) = timer(Some(d * 5));

        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        clock.advance(d * 20);
        let slept = clock.slept();

        assert_eq!(timer.delay_interval(d), Pace::Slipped(19));
        assert_eq!(clock.slept(), slept, "must not sleep off the backlog");
        assert_eq!(timer.target(), Some(clock.now()));

        let now = clock.now();
        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(clock.now(), now + d);
    }

    #[test]
    fn backward_clock_resynchronizes() {
        let d = Duration::from_millis(10);
        let (clock, mut timer) = timer(None);

        for _ in 0..5 {
            timer.delay_interval(d);
        }
        clock.rewind(d * 4);
        let now = clock.now();
        let slept = clock.slept();

        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(timer.target(), Some(now + d));
        assert_eq!(clock.slept() - slept, d, "must not sleep across the clock jump");
    }

    #[test]
    fn oversleep_reported() {
        let d = Duration::from_millis(10);
        let (clock, mut timer) = timer(None);

        clock.set_oversleep(d * 3);
        assert_eq!(timer.delay_interval(d), Pace::OverSlept(d * 3));
    }

    #[test]
    fn min_delay_skips_short_sleeps() {
        let d = Duration::from_millis(10);
        let clock = ManualClock::starting_at(Timestamp::from_micros(START));
        let mut timer = PacingTimer::with_clock(clock.clone(), None, Duration::from_millis(5));

        clock.advance(Duration::from_millis(7));
        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(clock.sleeps(), 1);

        clock.advance(Duration::from_millis(7));
        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(clock.sleeps(), 1, "3ms remainder is below the minimum delay");
    }

    #[test]
    fn huge_delta_saturates() {
        let d = Duration::from_secs(u64::MAX / 1000);
        let (clock, mut timer) = timer(None);

        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(timer.target(), Some(Timestamp::from_micros(u64::MAX)));
        assert_eq!(clock.slept(), Duration::from_micros(i64::MAX as u64));

        assert_eq!(Timestamp::from_micros(u64::MAX - 1) + Duration::MAX, Timestamp::from_micros(u64::MAX));
        assert_eq!(Timestamp::from_micros(u64::MAX).micros_since(Timestamp::from_micros(0)), i64::MAX);
        assert_eq!(Timestamp::from_micros(0).micros_since(Timestamp::from_micros(u64::MAX)), -i64::MAX);
    }

    #[test]
    fn restart() {
        let d = Duration::from_millis(10);
        let (clock, mut timer) = timer(None);

        timer.delay_interval(d);
        clock.advance(Duration::from_secs(1));
        timer.restart();
        assert_eq!(timer.target(), None);
        let now = clock.now();
        assert_eq!(timer.delay_interval(d), Pace::OnTime);
        assert_eq!(timer.target(), Some(now + d));
    }
}
