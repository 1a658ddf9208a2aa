use std::time::{Duration, Instant};

/// Fixed-window request counter.
///
/// The window covers `[start, start + length)`; once `now` passes the end the
/// counter resets and the start advances to the boundary `now` falls in.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    length: Duration,
    start: Instant,
    count: u32,
}

impl FixedWindow {
    pub fn new(length: Duration, now: Instant) -> Self {
        Self {
            length,
            start: now,
            count: 0,
        }
    }

    /// Reset the counter if `now` lies past the current window.
    pub fn refresh(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < self.length || self.length.is_zero() {
            return;
        }
        let periods = (elapsed.as_nanos() / self.length.as_nanos()) as u32;
        self.start += self.length * periods;
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn hit(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    pub fn is_exhausted(&self, limit: u32) -> bool {
        self.count >= limit
    }

    /// Time until the counter resets.
    pub fn resets_in(&self, now: Instant) -> Duration {
        (self.start + self.length).saturating_duration_since(now)
    }

    pub fn length(&self) -> Duration {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let now = Instant::now();
        let mut w = FixedWindow::new(Duration::from_secs(60), now);
        for _ in 0..3 {
            w.refresh(now);
            w.hit();
        }
        assert_eq!(w.count(), 3);
        assert_eq!(w.remaining(5), 2);
        assert!(!w.is_exhausted(5));
        assert!(w.is_exhausted(3));
    }

    #[test]
    fn test_resets_at_boundary() {
        let now = Instant::now();
        let mut w = FixedWindow::new(Duration::from_secs(60), now);
        w.hit();
        w.hit();
        w.refresh(now + Duration::from_secs(59));
        assert_eq!(w.count(), 2);
        w.refresh(now + Duration::from_secs(61));
        assert_eq!(w.count(), 0);
        // Boundary advanced to start + 60s, so the next reset is 59s away.
        assert_eq!(
            w.resets_in(now + Duration::from_secs(61)),
            Duration::from_secs(59)
        );
    }

    #[test]
    fn test_skips_several_periods() {
        let now = Instant::now();
        let mut w = FixedWindow::new(Duration::from_secs(10), now);
        w.hit();
        w.refresh(now + Duration::from_secs(35));
        assert_eq!(w.count(), 0);
        assert_eq!(
            w.resets_in(now + Duration::from_secs(35)),
            Duration::from_secs(5)
        );
    }
}
