use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on any retry delay (one year), whatever `max_delay_secs` says.
pub const MAX_DELAY_SECS: u64 = 365 * 24 * 3600;

/// Retry policy applied to `handler_failure` and `handler_timeout` outcomes.
///
/// `max_attempts` counts executions, not retries: `1` means a single attempt
/// with no retry, `3` means the third consecutive failure is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay that may be randomly shaved off, `0.0..=1.0`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    30
}

fn default_max_delay() -> u64 {
    3600
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy without randomness, handy for deterministic tests.
    pub fn fixed(max_attempts: u32, base_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            base_delay_secs,
            max_delay_secs: base_delay_secs.max(default_max_delay()),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32, max_attempts_override: Option<u32>) -> bool {
        attempts < max_attempts_override.unwrap_or(self.max_attempts)
    }

    /// Exponential delay for the given 1-indexed failed attempt, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let multiplier = self.multiplier.max(1.0);
        let raw = self.base_delay_secs as f64 * multiplier.powi(exponent);
        let ceiling = self.max_delay_secs.min(MAX_DELAY_SECS) as f64;
        let capped = raw.min(ceiling).max(0.0);
        Duration::milliseconds((capped * 1000.0) as i64)
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let shave = rng.gen_range(0.0..=jitter);
        let ms = base.num_milliseconds() as f64 * (1.0 - shave);
        Duration::milliseconds(ms as i64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay_secs, 30);
        assert_eq!(p.max_delay_secs, 3600);
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_secs: 10,
            max_delay_secs: 100,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.base_delay(1), Duration::seconds(10));
        assert_eq!(p.base_delay(2), Duration::seconds(20));
        assert_eq!(p.base_delay(3), Duration::seconds(40));
        assert_eq!(p.base_delay(4), Duration::seconds(80));
        assert_eq!(p.base_delay(5), Duration::seconds(100));
        assert_eq!(p.base_delay(60), Duration::seconds(100));
    }

    #[test]
    fn jitter_only_shortens_within_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::fixed(5, 60)
        };
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=4 {
            let base = p.base_delay(attempt);
            for _ in 0..50 {
                let d = p.delay_with(attempt, &mut rng);
                assert!(d <= base);
                assert!(d.num_milliseconds() >= base.num_milliseconds() / 2);
            }
        }
    }

    #[test]
    fn should_retry_counts_executions() {
        let p = RetryPolicy::fixed(3, 1);
        assert!(p.should_retry(1, None));
        assert!(p.should_retry(2, None));
        assert!(!p.should_retry(3, None));
        assert!(!p.should_retry(1, Some(1)));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let p: RetryPolicy = serde_yaml::from_str("max_attempts: 5\n").unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay_secs, 30);
        assert!((p.jitter - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn huge_configured_delays_are_bounded() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_secs: u64::MAX,
            max_delay_secs: u64::MAX,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.base_delay(1), Duration::seconds(MAX_DELAY_SECS as i64));
        assert_eq!(p.base_delay(64), Duration::seconds(MAX_DELAY_SECS as i64));
    }
}
