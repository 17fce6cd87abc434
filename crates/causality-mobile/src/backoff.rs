//! Exponential backoff with symmetric jitter.

use rand::Rng;
use std::time::Duration;

/// Retry schedule: exponential base-2 growth from `base`, capped at `cap`,
/// with a symmetric jitter fraction so a fleet of clients recovering from
/// the same outage does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay used as the jitter half-range, e.g. 0.2 for
    /// +/-20%.  Zero disables jitter (deterministic tests).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5 * 60),
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` failures (0-based: the delay
    /// after the first failure is `base`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(self.cap);
        if self.jitter <= 0.0 {
            return exp;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_secs_f64(exp.as_secs_f64() * factor)
    }
}
