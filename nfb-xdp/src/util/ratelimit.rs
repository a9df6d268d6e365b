//! Windowed limiter for per-packet diagnostics.

use std::time::{Duration, Instant};

/// Allows up to `burst` events per `interval`; everything beyond is counted
/// and reported with the first event of the next window.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    window_start: Option<Instant>,
    emitted: u32,
    suppressed: u64,
}

impl RateLimiter {
    pub const fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            window_start: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` when the caller may log now, with the
    /// number of events swallowed since the last allowed one.
    pub fn check(&mut self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Option<u64> {
        let expired = self
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) >= self.interval);
        if expired {
            self.window_start = Some(now);
            self.emitted = 0;
        }
        if self.emitted < self.burst {
            self.emitted += 1;
            Some(core::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

impl Default for RateLimiter {
    /// Ten messages per five seconds.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 10)
    }
}
