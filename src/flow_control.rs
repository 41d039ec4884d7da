//! Retry backoff for the reconciliation work queue.

use std::time::Duration;

/// Per-id exponential backoff state.
///
/// delay = min(base_delay * 2^(attempts-1), max_delay)
#[derive(Debug)]
pub struct RetryManager {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5))
    }
}

impl RetryManager {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            base_delay,
            max_delay,
        }
    }

    /// Record a failed or inconclusive attempt.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Forget accumulated attempts after success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = self.attempts.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}
