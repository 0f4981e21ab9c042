//! Circuit breaker for the feed poller

use std::time::{Duration, Instant};

/// Suspends an operation after a run of consecutive failures.
///
/// When the failure count reaches the threshold the breaker opens for the
/// cooldown period. On expiry the count resets and the operation resumes.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            failures: 0,
            open_until: None,
        }
    }

    /// Record a failure at `now`. Returns true if this failure opened the
    /// breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.open_until.is_some() {
            return false;
        }
        self.failures += 1;
        if self.failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            self.failures = 0;
            return true;
        }
        false
    }

    /// Record a success; resets the consecutive-failure count.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// True while the breaker is open at `now`. An expired breaker closes
    /// and resets its count.
    pub fn is_open(&mut self, now: Instant) -> bool {
        match self.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.open_until = None;
                self.failures = 0;
                false
            }
            None => false,
        }
    }

    /// Consecutive failures recorded so far.
    pub fn failure_count(&self) -> u32 {
        self.failures
    }
}
