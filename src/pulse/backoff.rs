//! Reconnect backoff policy.

use std::time::Duration;

use rand::{Rng, thread_rng};

use crate::config::PulseConfig;

/// Exponential backoff with symmetric jitter and a bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub factor: f64,
    /// Fractional jitter applied in both directions (0.2 = ±20%).
    pub jitter: f64,
    /// Consecutive failed attempts tolerated before the source gives up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_backoff_initial_ms),
            cap: Duration::from_millis(config.reconnect_backoff_cap_ms),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Un-jittered delay before retry number `attempt` (zero-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let millis = (self.initial.as_millis() as f64 * self.factor.powi(exponent))
            .min(self.cap.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt`, jittered by ±`jitter`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * self.jitter;
        let jittered = thread_rng().gen_range((base - spread)..=(base + spread));
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&PulseConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(32));
        assert_eq!(policy.base_delay(6), Duration::from_secs(60));
        assert_eq!(policy.base_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..10 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            let delay = policy.delay(attempt).as_millis() as f64;
            assert!(delay >= base * 0.8 - 1.0, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base * 1.2 + 1.0, "attempt {attempt}: {delay} > {base}");
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(29));
        assert!(policy.exhausted(30));
    }
}
