//! Reconnection delay policy.
//!
//! Exponential growth from `initial_delay`, capped at `max_delay`, with a
//! symmetric random jitter so a fleet of dashboards does not reconnect in
//! lockstep after a server restart.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Jitter as a fraction of the computed delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-indexed). Never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis().min(u64::MAX as u128) as f64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as f64;
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms * self.factor.powi(exp)).min(max_ms);

        let jitter_ms = if self.jitter > 0.0 && base_ms > 0.0 {
            let range = base_ms * self.jitter;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter_ms).clamp(0.0, max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}
