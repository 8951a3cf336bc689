//! Exponential-backoff parameters for re-establishing a dropped bus
//! connection.
//!
//! The loop itself lives in [`ConnectionManager`](crate::ConnectionManager);
//! this module only computes delays.

use std::time::Duration;

/// Backoff policy applied after an established link drops.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before attempt 1.
    pub initial_delay: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Attempts made after a drop before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait before the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = next_delay(delay, self);
        }
        delay
    }
}

/// Delay following `current`, capped at [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(4));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[test]
    fn attempt_delays_follow_capped_doubling() {
        let config = ReconnectConfig::default();
        let expected = [2, 4, 8, 16, 30, 30, 30, 30, 30, 30];

        for (i, &secs) in expected.iter().enumerate() {
            let attempt = i as u32 + 1;
            assert_eq!(config.delay_for_attempt(attempt).as_secs(), secs);
        }
    }

    #[test]
    fn initial_delay_above_cap_is_clamped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(90),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(30));
    }

    #[test]
    fn attempt_zero_uses_initial_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
    }
}
