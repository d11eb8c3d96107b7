//! Wall-clock and monotonic time sources.
//!
//! Calendar targets are always computed from [`Clock::now_utc`]; how long to
//! sleep is always measured on [`Clock::monotonic`]. The monotonic source is
//! `tokio::time::Instant` so paused-time tests drive both.

use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Current wall-clock time. May jump (NTP steps, manual changes).
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current monotonic time. Never goes backwards.
    fn monotonic(&self) -> Instant;
}

/// The real clocks of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Monotonic instant at which `target` is reached, given that `reference`
/// was the wall-clock time observed at `monotonic_now`.
///
/// Targets at or before the reference map to `monotonic_now`.
pub fn deadline_for(target: DateTime<Utc>, reference: DateTime<Utc>, monotonic_now: Instant) -> Instant {
    let ahead = (target - reference).to_std().unwrap_or(Duration::ZERO);
    monotonic_now + ahead
}

/// Signed milliseconds from `deadline` to `now` (negative while early).
pub fn monotonic_delta_ms(now: Instant, deadline: Instant) -> i64 {
    if now >= deadline {
        (now - deadline).as_millis() as i64
    } else {
        -((deadline - now).as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_wall_distance() {
        let reference = Utc.with_ymd_and_hms(2026, 5, 4, 6, 58, 0).unwrap();
        let target = Utc.with_ymd_and_hms(2026, 5, 4, 7, 0, 0).unwrap();
        let now = Instant::now();
        assert_eq!(deadline_for(target, reference, now), now + Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn past_target_is_due_immediately() {
        let reference = Utc.with_ymd_and_hms(2026, 5, 4, 7, 1, 0).unwrap();
        let target = Utc.with_ymd_and_hms(2026, 5, 4, 7, 0, 0).unwrap();
        let now = Instant::now();
        assert_eq!(deadline_for(target, reference, now), now);
    }

    #[tokio::test(start_paused = true)]
    async fn delta_is_signed() {
        let now = Instant::now();
        assert_eq!(monotonic_delta_ms(now, now + Duration::from_millis(1500)), -1500);
        assert_eq!(monotonic_delta_ms(now + Duration::from_secs(2), now), 2000);
    }
}
