//! Time-based flush trigger.

use std::time::{Duration, Instant};

/// Decides when everything accumulated must be flushed regardless of counts.
///
/// Keeps a single "last flush" instant; the flush is due once `interval`
/// has elapsed since it.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    interval: Duration,
    last_flush: Instant,
}

impl FlushScheduler {
    pub fn new(interval: Duration, started: Instant) -> Self {
        Self {
            interval,
            last_flush: started,
        }
    }

    pub fn is_due_at(&self, now: Instant) -> bool {
        now >= self.last_flush + self.interval
    }

    /// Restart the interval from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_flush = now;
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the next flush is due.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        (self.last_flush + self.interval).saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn not_due_before_interval() {
        let start = Instant::now();
        let sched = FlushScheduler::new(MINUTE, start);
        assert!(!sched.is_due_at(start));
        assert!(!sched.is_due_at(start + Duration::from_secs(59)));
    }

    #[test]
    fn due_exactly_at_interval() {
        let start = Instant::now();
        let sched = FlushScheduler::new(MINUTE, start);
        assert!(sched.is_due_at(start + MINUTE));
        assert!(sched.is_due_at(start + MINUTE * 2));
    }

    #[test]
    fn reset_restarts_interval() {
        let start = Instant::now();
        let mut sched = FlushScheduler::new(MINUTE, start);
        let later = start + MINUTE;
        sched.reset(later);

        assert_eq!(sched.last_flush(), later);
        assert!(!sched.is_due_at(later + Duration::from_secs(30)));
        assert!(sched.is_due_at(later + MINUTE));
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let start = Instant::now();
        let sched = FlushScheduler::new(MINUTE, start);
        assert_eq!(sched.remaining_at(start + Duration::from_secs(45)), Duration::from_secs(15));
        assert_eq!(sched.remaining_at(start + MINUTE * 3), Duration::ZERO);
    }
}
