//! Retry backoff policies.

use crate::definition::BackoffSettings;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows with each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// delay = base * 2^attempts
    #[default]
    Exponential,
    /// delay = base * attempts
    Linear,
    /// delay = base
    Fixed,
}

/// Randomization applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the computed delay as-is.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Backoff configuration carried by every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Growth strategy.
    #[serde(default)]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: Jitter::None,
        }
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        Self::exponential(settings.base_delay_ms, settings.max_delay_ms)
    }
}

impl BackoffPolicy {
    /// Exponential backoff without jitter.
    #[must_use]
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
            max_delay_ms,
            jitter: Jitter::None,
        }
    }

    /// Fixed backoff without jitter.
    #[must_use]
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: Jitter::None,
        }
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, given how many executions already ran.
    ///
    /// For the exponential kind this is `min(base * 2^attempts, cap)`.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.kind {
            BackoffKind::Exponential => base
                .saturating_mul(2u64.saturating_pow(attempts))
                .min(max),
            BackoffKind::Linear => base.saturating_mul(u64::from(attempts.max(1))).min(max),
            BackoffKind::Fixed => base.min(max),
        };

        let jittered = match self.jitter {
            Jitter::None => delay,
            Jitter::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            Jitter::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_from_attempt_count() {
        let policy = BackoffPolicy::exponential(1_000, 30_000);

        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(16_000));
    }

    #[test]
    fn test_exponential_capped() {
        let policy = BackoffPolicy::exponential(1_000, 30_000);
        assert_eq!(policy.delay_for(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = BackoffPolicy {
            kind: BackoffKind::Linear,
            base_delay_ms: 100,
            max_delay_ms: 250,
            jitter: Jitter::None,
        };
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for(3), Duration::from_millis(250));

        let fixed = BackoffPolicy::fixed(50);
        assert_eq!(fixed.delay_for(7), Duration::from_millis(50));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = BackoffPolicy::exponential(100, 1_000).with_jitter(Jitter::Full);
        for _ in 0..20 {
            assert!(policy.delay_for(1) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_from_settings() {
        let policy = BackoffPolicy::from(&BackoffSettings {
            base_delay_ms: 10,
            max_delay_ms: 40,
        });
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }
}
