//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::Result;
use crate::utils::BackoffPolicy;

fn default_abort_grace_period_ms() -> u64 {
    60_000
}

fn default_max_cas_attempts() -> u32 {
    5
}

fn default_batch_size() -> usize {
    16
}

fn default_poll_duration_ms() -> u64 {
    500
}

fn default_bus_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_timeout_poll_interval_ms() -> u64 {
    1_000
}

/// Settings for the queue consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Messages read per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a read waits for the first message.
    #[serde(default = "default_poll_duration_ms")]
    pub poll_duration_ms: u64,
    /// Backoff while the bus is unavailable.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_duration_ms: default_poll_duration_ms(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Read poll duration.
    #[must_use]
    pub fn poll_duration(&self) -> Duration {
        Duration::from_millis(self.poll_duration_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long an aborting node may take to acknowledge before it is
    /// forced to ABORTED.
    #[serde(default = "default_abort_grace_period_ms")]
    pub abort_grace_period_ms: u64,
    /// Re-read attempts after a lost compare-and-swap.
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
    /// Queue consumer settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Redelivery delay for unacknowledged messages.
    #[serde(default = "default_bus_visibility_timeout_ms")]
    pub bus_visibility_timeout_ms: u64,
    /// Interval between timeout polls.
    #[serde(default = "default_timeout_poll_interval_ms")]
    pub timeout_poll_interval_ms: u64,
    /// Delete node executions once their plan finishes.
    #[serde(default)]
    pub prune_on_completion: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            abort_grace_period_ms: default_abort_grace_period_ms(),
            max_cas_attempts: default_max_cas_attempts(),
            consumer: ConsumerConfig::default(),
            bus_visibility_timeout_ms: default_bus_visibility_timeout_ms(),
            timeout_poll_interval_ms: default_timeout_poll_interval_ms(),
            prune_on_completion: false,
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the abort grace period.
    #[must_use]
    pub fn with_abort_grace_period_ms(mut self, ms: u64) -> Self {
        self.abort_grace_period_ms = ms;
        self
    }

    /// Sets the CAS attempt bound.
    #[must_use]
    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Sets the consumer settings.
    #[must_use]
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Sets the bus visibility timeout.
    #[must_use]
    pub fn with_bus_visibility_timeout_ms(mut self, ms: u64) -> Self {
        self.bus_visibility_timeout_ms = ms;
        self
    }

    /// Sets the timeout poll interval.
    #[must_use]
    pub fn with_timeout_poll_interval_ms(mut self, ms: u64) -> Self {
        self.timeout_poll_interval_ms = ms;
        self
    }

    /// Enables or disables pruning on plan completion.
    #[must_use]
    pub fn with_prune_on_completion(mut self, prune: bool) -> Self {
        self.prune_on_completion = prune;
        self
    }

    /// Bus visibility timeout.
    #[must_use]
    pub fn bus_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_visibility_timeout_ms)
    }

    /// Timeout poll interval.
    #[must_use]
    pub fn timeout_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_poll_interval_ms)
    }
}
