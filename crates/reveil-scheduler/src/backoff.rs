use tokio::time::Duration;

/// Jitter fraction applied on top of each delay (0 … +10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Exponential backoff: `base → 2·base → 4·base → … → max` (cap), plus jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { max, current: base }
    }

    /// Delay before the next retry, without jitter. Advances the schedule.
    pub fn next_base_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay before the next retry with jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base_delay();
        base + jitter(base)
    }
}

/// Jitter offset in `0 … JITTER_FRACTION * base`.
///
/// Derived from the sub-second nanoseconds of the system clock, which is
/// enough to spread retries against a shared failing dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter_ms = ((base.as_millis() as f64) * JITTER_FRACTION) as u64;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(nanos as u64 % max_jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| b.next_base_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(10));
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d >= Duration::from_secs(10));
            assert!(d < Duration::from_secs(11));
        }
    }

    #[test]
    fn max_below_base_is_clamped() {
        let mut b = Backoff::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(b.next_base_delay(), Duration::from_secs(3));
        assert_eq!(b.next_base_delay(), Duration::from_secs(3));
    }
}
