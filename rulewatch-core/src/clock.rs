//! Observation clock.
//!
//! Event timestamps are wall-clock values, but they are derived from the
//! runtime's monotonic [`Instant`] anchored at construction. Settle and rate
//! windows therefore never see time run backwards, and paused-time tests
//! advance event timestamps together with sleeps.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct Clock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.anchor.elapsed()).unwrap_or(TimeDelta::zero());
        self.anchor_wall + elapsed
    }
}

/// Signed distance `later - earlier` in seconds, microsecond precision.
pub fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

/// `at` moved forward by `secs` seconds, rounded to microseconds.
pub fn advance(at: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    at + TimeDelta::microseconds((secs * 1_000_000.0).round() as i64)
}
