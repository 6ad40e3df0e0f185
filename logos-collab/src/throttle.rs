//! Leading-edge rate limiter.
//!
//! The first call in a window passes and opens the window; calls inside the
//! window are dropped, never queued. Over any span `T` at most
//! `T / min_interval + 1` calls pass.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Whether a write may go out now.
    #[inline]
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
