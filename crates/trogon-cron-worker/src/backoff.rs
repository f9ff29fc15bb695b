use std::time::Duration;

/// Bounded retry schedule for (re)subscribing to a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Ceiling applied after jitter.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with ±20 % jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = exponential(self.base_delay, attempt);
        let factor = 0.8 + rand::random::<f64>() * 0.4;
        let jittered = Duration::from_millis((base.as_millis() as f64 * factor) as u64);
        jittered.min(self.max_delay)
    }
}

/// `base * 2^(attempt-1)`, capped at 32x.
fn exponential(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    base * (1u32 << exponent)
}
