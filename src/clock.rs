use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Source of "now" for the measurement workflow.
///
/// Everything that compares against a due instant reads time through this
/// trait so tests can drive it with tokio's paused clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time anchored once, then advanced by tokio's monotonic clock.
///
/// Due instants computed at scheduling time stay consistent with the
/// countdown even if the host clock is adjusted mid-exam. Under
/// `tokio::time::pause()` the clock only moves with `time::advance`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall_anchor: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            anchor: Instant::now(),
        }
    }

    pub fn shared(self) -> SharedClock {
        Arc::new(self)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_anchor + elapsed
    }
}

/// Periodic tick source for countdowns. Missed ticks are delayed rather than
/// bursted, so a stalled loop never replays a backlog of countdown events.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Milliseconds from `now` until `target`; negative once `target` has passed.
pub fn remaining_ms(target: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (target - now).num_milliseconds()
}

/// Countdown text shown on an exam card: `07m 05s`, or `2h 59m 59s` for the
/// three-hour curve interval. Negative values render as zero.
pub fn format_countdown(remaining_ms: i64) -> String {
    let total_secs = remaining_ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else {
        format!("{minutes:02}m {seconds:02}s")
    }
}

pub fn format_remaining(remaining: &Duration) -> String {
    format_countdown(i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX))
}
