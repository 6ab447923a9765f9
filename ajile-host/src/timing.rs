// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Device time.
//!
//! Controllers count time in ticks of a 100 MHz clock. Frame times, repeat times, trigger hold
//! times and status timestamps are all expressed in [`Ticks`].
use core::fmt;
use core::ops::{Add, AddAssign, Mul, Sub};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const TICKS_PER_SECOND: u64 = 100_000_000;

/// The shortest frame a DMD can display.
pub const DMD_MIN_FRAME_TIME: Ticks = Ticks(10_500);

/// The non-displaying part of every DMD frame.
///
/// Color and grayscale items are built from many back-to-back bitplanes, so their display time is
/// reduced by one FOT for every bitplane.
pub const DMD_FOT: Ticks = Ticks(1_600);

/// The shortest exposure a CMV camera accepts.
pub const CAMERA_MIN_FRAME_TIME: Ticks = Ticks(1_000);

/// The CMV sensor's frame overhead time, about 59µs.
///
/// A camera frame occupies its exposure time plus this overhead.
pub const CMV_FOT: Ticks = Ticks(5_900);

/// Extra slack taken off camera exposures that are paced by another component.
pub const CAMERA_SAFETY_MARGIN: Ticks = Ticks(100);

/// A span or instant of device time.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub fn from_sec(seconds: f64) -> Self {
        Self::from_float(seconds * TICKS_PER_SECOND as f64)
    }

    pub fn from_ms(milliseconds: f64) -> Self {
        Self::from_float(milliseconds * (TICKS_PER_SECOND / 1_000) as f64)
    }

    pub fn from_us(microseconds: f64) -> Self {
        Self::from_float(microseconds * (TICKS_PER_SECOND / 1_000_000) as f64)
    }

    fn from_float(ticks: f64) -> Self {
        if ticks.is_finite() && ticks > 0.0 {
            Self(ticks.round() as u64)
        } else {
            Self::ZERO
        }
    }

    pub fn to_ms(self) -> f64 {
        self.0 as f64 / (TICKS_PER_SECOND / 1_000) as f64
    }

    pub fn to_duration(self) -> Duration {
        Duration::from_nanos(self.0 * (1_000_000_000 / TICKS_PER_SECOND))
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self((duration.as_nanos() / (1_000_000_000 / TICKS_PER_SECOND) as u128) as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.to_ms())
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, other: Ticks) -> Ticks {
        Ticks(self.0 + other.0)
    }
}

impl AddAssign for Ticks {
    fn add_assign(&mut self, other: Ticks) {
        self.0 += other.0;
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, other: Ticks) -> Ticks {
        Ticks(self.0 - other.0)
    }
}

impl Mul<u64> for Ticks {
    type Output = Ticks;

    fn mul(self, factor: u64) -> Ticks {
        Ticks(self.0 * factor)
    }
}

impl core::iter::Sum for Ticks {
    fn sum<I: Iterator<Item = Ticks>>(iter: I) -> Ticks {
        iter.fold(Ticks::ZERO, Add::add)
    }
}

/// The exposure to request from a camera that must be ready again within `period`.
///
/// A camera frame lasts its exposure plus [`CMV_FOT`]. When a camera is triggered by another
/// component every `period`, anything longer than this misses the next trigger.
pub fn camera_exposure_budget(period: Ticks) -> Ticks {
    period.saturating_sub(CMV_FOT).saturating_sub(CAMERA_SAFETY_MARGIN)
}

/// The display time left for a 24-bitplane color frame occupying `period`.
pub fn color_display_time(period: Ticks) -> Ticks {
    period.saturating_sub(DMD_FOT * 24)
}

/// A source of monotonic device time.
pub trait MonotonicClock {
    fn now_ticks(&self) -> Ticks;
}

/// Ticks elapsed since the clock was created, read from [`Instant`].
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ticks(&self) -> Ticks {
        Ticks::from_duration(self.origin.elapsed())
    }
}

/// How long a blocking call may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTimeout {
    Forever,
    After(Ticks),
}

impl WaitTimeout {
    /// Convert the `-1 = forever` convention into a timeout.
    pub fn from_ticks(ticks: i64) -> Self {
        if ticks < 0 {
            WaitTimeout::Forever
        } else {
            WaitTimeout::After(Ticks(ticks as u64))
        }
    }

    pub fn from_ms(milliseconds: f64) -> Self {
        if milliseconds < 0.0 {
            WaitTimeout::Forever
        } else {
            WaitTimeout::After(Ticks::from_ms(milliseconds))
        }
    }

    /// The instant a wait starting now gives up at, or `None` to wait forever.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            WaitTimeout::Forever => None,
            WaitTimeout::After(ticks) => Some(Instant::now() + ticks.to_duration()),
        }
    }
}

impl From<i64> for WaitTimeout {
    fn from(ticks: i64) -> Self {
        Self::from_ticks(ticks)
    }
}

impl From<Duration> for WaitTimeout {
    fn from(duration: Duration) -> Self {
        WaitTimeout::After(Ticks::from_duration(duration))
    }
}

#[cfg(test)]
mod test {
    use float_cmp::approx_eq;

    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(Ticks::from_ms(10.0), Ticks(1_000_000));
        assert_eq!(Ticks::from_us(1.0), Ticks(100));
        assert_eq!(Ticks::from_sec(1.0 / 6600.0), Ticks(15_152));
        assert!(approx_eq!(f64, Ticks(1_000_000).to_ms(), 10.0, ulps = 2));
        assert_eq!(Ticks::from_ms(-4.0), Ticks::ZERO);
    }

    #[test]
    fn duration_round_trip() {
        let ticks = Ticks::from_ms(12.5);
        assert_eq!(Ticks::from_duration(ticks.to_duration()), ticks);
    }

    #[test]
    fn exposure_budget_leaves_room_for_overhead() {
        let period = Ticks::from_ms(10.0);
        let exposure = camera_exposure_budget(period);
        assert!(exposure + CMV_FOT < period);
        assert_eq!(camera_exposure_budget(Ticks(10)), Ticks::ZERO);
    }

    #[test]
    fn negative_timeout_is_forever() {
        assert_eq!(WaitTimeout::from_ticks(-1), WaitTimeout::Forever);
        assert_eq!(WaitTimeout::from(250i64), WaitTimeout::After(Ticks(250)));
        assert!(WaitTimeout::Forever.deadline().is_none());
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ticks();
        let second = clock.now_ticks();
        assert!(second >= first);
    }
}
