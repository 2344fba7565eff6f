//! # Exponential Backoff
//!
//! Bounded retry schedule for calls to external services. Each step waits
//! `factor` times longer than the previous one; the schedule ends after `steps`
//! waits so a caller always gives up after a known number of attempts.

use std::time::Duration;

/// Exponential backoff calculator
///
/// `next_backoff()` yields `base`, `base * factor`, `base * factor^2`, ... and
/// `None` once `steps` delays were handed out.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    factor: f64,
    steps: u32,
    taken: u32,
}

impl ExponentialBackoff {
    /// Create a backoff of `steps` delays starting at `base`
    #[must_use]
    pub fn new(base: Duration, factor: f64, steps: u32) -> Self {
        Self {
            base,
            factor,
            steps,
            taken: 0,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.taken >= self.steps {
            return None;
        }
        let delay = self.base.mul_f64(self.factor.powi(self.taken as i32));
        self.taken += 1;
        Some(delay)
    }
}
