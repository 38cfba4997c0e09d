//! Clock primitives: a monotone CPU timer, an interval latch and the
//! `TimeStamp` seconds type used on the wire by the precision clock.

use std::ops::{Add, Neg, Sub};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::codec::{Chunk, Encode, Value};

/// Captures a monotone time point and reports seconds elapsed since it.
/// Unaffected by wall-clock adjustments.
#[derive(Debug, Clone, Copy)]
pub struct CpuTimer {
    start: Instant,
}

impl CpuTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Seconds elapsed since construction or the last `start`.
    pub fn interval(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for CpuTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires at most once per interval. The first poll after construction fires
/// immediately.
#[derive(Debug)]
pub struct IntervalPoll {
    timer: CpuTimer,
    interval: f64,
    last: f64,
}

impl IntervalPoll {
    pub fn new(interval_ms: f64) -> Self {
        let timer = CpuTimer::new();
        let interval = interval_ms / 1000.0;
        let last = timer.interval() - interval;
        Self {
            timer,
            interval,
            last,
        }
    }

    /// True when the interval has elapsed since the last fire; latches the
    /// fire time.
    pub fn poll(&mut self) -> bool {
        let time = self.timer.interval();
        if time >= self.last + self.interval {
            self.last = time;
            true
        } else {
            false
        }
    }

    /// Milliseconds until the next fire, clamped at zero.
    pub fn until(&self) -> f64 {
        let time = self.timer.interval();
        ((self.last + self.interval) - time).max(0.0) * 1000.0
    }

    pub fn reset(&mut self) {
        self.timer.start();
        self.last = self.timer.interval() - self.interval;
    }
}

/// A point in time, in seconds, as exchanged by the sync protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TimeStamp(f64);

impl TimeStamp {
    pub fn new(seconds: f64) -> Self {
        Self(seconds)
    }

    pub fn half(self) -> Self {
        Self(self.0 * 0.5)
    }

    /// The time spanned by `count` samples at rate `sr`.
    pub fn from_samples(count: u64, sr: f64) -> Self {
        Self(count as f64 / sr)
    }

    /// This time as a rounded signed sample count at rate `sr`. Signed
    /// because clock offsets may be negative.
    pub fn as_samples(self, sr: f64) -> i64 {
        (self.0 * sr).round() as i64
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0
    }
}

impl From<f64> for TimeStamp {
    fn from(seconds: f64) -> Self {
        Self(seconds)
    }
}

impl Add for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp(self.0 + rhs.0)
    }
}

impl Sub for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp(self.0 - rhs.0)
    }
}

impl Neg for TimeStamp {
    type Output = TimeStamp;

    fn neg(self) -> TimeStamp {
        TimeStamp(-self.0)
    }
}

impl Value for TimeStamp {
    const SIZE: usize = <f64 as Value>::SIZE;

    fn put(&self, out: &mut Vec<u8>) {
        self.0.put(out);
    }

    fn take(bytes: &[u8]) -> Self {
        TimeStamp(f64::take(bytes))
    }
}

impl Encode for TimeStamp {
    fn encode(&self, chunk: &mut Chunk) {
        chunk.put(*self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic() {
        let a = TimeStamp::new(1.5);
        let b = TimeStamp::new(0.5);
        assert_eq!((a + b).as_secs_f64(), 2.0);
        assert_eq!((a - b).as_secs_f64(), 1.0);
        assert_eq!(a.half().as_secs_f64(), 0.75);
        assert!(b < a);
        assert_eq!((-a).as_secs_f64(), -1.5);
    }

    #[test]
    fn sample_conversions_round() {
        let sr = 44100.0;
        assert_eq!(TimeStamp::from_samples(44100, sr).as_secs_f64(), 1.0);
        assert_eq!(TimeStamp::new(1.0).as_samples(sr), 44100);
        // Rounding, not truncation, and negative counts survive.
        assert_eq!(TimeStamp::new(0.5000001).as_samples(2.0), 1);
        assert_eq!(TimeStamp::new(-1.0).as_samples(sr), -44100);
    }

    #[test]
    fn timestamp_wire_form_is_f64() {
        let c = crate::chunk![TimeStamp::new(0.125)];
        assert_eq!(c.as_bytes(), &0.125f64.to_le_bytes());
    }

    #[test]
    fn interval_poll_fires_once_per_interval() {
        let mut poll = IntervalPoll::new(10_000.0);
        // First poll fires immediately, then the latch holds.
        assert!(poll.poll());
        assert!(!poll.poll());
        assert!(!poll.poll());
        assert!(poll.until() > 0.0);
    }

    #[test]
    fn interval_poll_reset_rearms() {
        let mut poll = IntervalPoll::new(10_000.0);
        assert!(poll.poll());
        poll.reset();
        assert!(poll.poll());
    }

    #[test]
    fn cpu_timer_is_monotone() {
        let timer = CpuTimer::new();
        let a = timer.interval();
        let b = timer.interval();
        assert!(b >= a);
        assert!(a >= 0.0);
    }
}
