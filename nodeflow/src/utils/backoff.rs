//! Backoff policies with jitter.
//!
//! Used by queue consumers while the bus is unavailable and by the retry
//! adviser when a plan asks for computed wait intervals.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Randomization applied to the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Uniform in `0..=delay`.
    Full,
    /// Half fixed, half random.
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// A backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl BackoffPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the growth strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// The un-jittered delay for `attempt` (0-indexed).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let delay = match self.strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Constant => base,
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Per-consumer backoff progress.
#[derive(Debug, Default)]
pub struct BackoffState {
    attempt: u32,
    previous_ms: Option<u64>,
}

impl BackoffState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive failures recorded.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous_ms = None;
    }

    /// Records a failure and returns how long to wait before the next try.
    pub fn next_delay(&mut self, policy: &BackoffPolicy) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let delay = policy.base_delay(self.attempt).as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);

        let mut rng = rand::thread_rng();
        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rng.gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rng.gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = policy.base_delay_ms;
                let prev = self.previous_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(policy.max_delay_ms);
                if upper <= base {
                    base
                } else {
                    rng.gen_range(base..=upper)
                }
            }
        };

        self.previous_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_base_delay_is_capped() {
        let policy = BackoffPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000);

        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = BackoffPolicy::new()
            .with_base_delay_ms(50)
            .with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.base_delay(2), Duration::from_millis(150));

        let constant = linear.with_strategy(BackoffStrategy::Constant);
        assert_eq!(constant.base_delay(7), Duration::from_millis(50));
    }

    #[test]
    fn test_state_without_jitter_follows_policy() {
        let policy = BackoffPolicy::new().with_base_delay_ms(10);
        let mut state = BackoffState::new();

        assert_eq!(state.next_delay(&policy), Duration::from_millis(10));
        assert_eq!(state.next_delay(&policy), Duration::from_millis(20));
        assert_eq!(state.attempt(), 2);

        state.reset();
        assert_eq!(state.next_delay(&policy), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(800)
            .with_jitter(JitterStrategy::Full);
        let mut state = BackoffState::new();
        for _ in 0..20 {
            assert!(state.next_delay(&policy) <= Duration::from_millis(800));
        }

        let policy = policy.with_jitter(JitterStrategy::Decorrelated);
        let mut state = BackoffState::new();
        for _ in 0..20 {
            let d = state.next_delay(&policy);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: BackoffPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, BackoffPolicy::default());
    }
}
