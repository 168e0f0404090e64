//! Minute-precision wall clock shared by the coordinator and participants.

use chrono::{NaiveTime, Timelike};
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU16, Ordering};
use rand::Rng;

use crate::proto::ProtoError;

/// Number of minutes in one day; every clock value lives in `0..MINUTES_PER_DAY`.
pub const MINUTES_PER_DAY: i64 = 24 * 60;

/// A time of day at minute granularity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u16);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);

    /// Build from hour and minute; `None` if either is out of range.
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self((hour * 60 + minute) as u16))
    }

    /// Build from any minute count, wrapping into a single day.
    pub fn from_minutes(minutes: i64) -> Self {
        Self(minutes.rem_euclid(MINUTES_PER_DAY) as u16)
    }

    /// A uniformly random minute of the day.
    pub fn random() -> Self {
        Self(rand::rng().random_range(0..MINUTES_PER_DAY as u16))
    }

    #[inline]
    pub fn minutes(self) -> i64 {
        self.0 as i64
    }

    pub fn hour(self) -> u32 {
        (self.0 / 60) as u32
    }

    pub fn minute(self) -> u32 {
        (self.0 % 60) as u32
    }

    /// Shift by a signed number of minutes, wrapping across midnight in both directions.
    pub fn add_minutes(self, delta: i64) -> Self {
        Self::from_minutes(self.minutes() + delta.rem_euclid(MINUTES_PER_DAY))
    }

    /// Signed difference `self - other` in minutes. Not normalized: `00:10` vs `23:50`
    /// is `-1420`, not `+20`.
    pub fn offset_from(self, other: ClockTime) -> i64 {
        self.minutes() - other.minutes()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = ProtoError;

    /// Parses `HH:mm`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| ProtoError::MalformedTime(s.to_string()))?;
        Ok(t.into())
    }
}

impl From<NaiveTime> for ClockTime {
    fn from(t: NaiveTime) -> Self {
        Self((t.hour() * 60 + t.minute()) as u16)
    }
}

/// Get/set access to an entity's logical clock.
///
/// Implemented separately by the coordinator and by participants; the only shared
/// behavior is the provided `adjust`.
pub trait ClockHolder {
    fn time(&self) -> ClockTime;
    fn set_time(&self, time: ClockTime);

    /// Apply a signed minute delta and return the new time.
    fn adjust(&self, delta_minutes: i64) -> ClockTime {
        let next = self.time().add_minutes(delta_minutes);
        self.set_time(next);
        next
    }
}

/// A threadsafe clock cell.
#[derive(Debug)]
pub struct ClockCell(AtomicU16);

impl ClockCell {
    pub fn new(time: ClockTime) -> Self {
        Self(AtomicU16::new(time.0))
    }

    /// A cell starting at a random minute of the day.
    pub fn random() -> Self {
        Self::new(ClockTime::random())
    }
}

impl ClockHolder for ClockCell {
    #[inline]
    fn time(&self) -> ClockTime {
        ClockTime(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn set_time(&self, time: ClockTime) {
        self.0.store(time.0, Ordering::Release)
    }
}
