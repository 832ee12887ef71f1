//! Retry adviser parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::Status;
use crate::utils::BackoffPolicy;

/// What happens once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterRetryAction {
    /// Keep the failure and move on to `next_node_id` (or the parent).
    #[default]
    Proceed,
    /// End the plan with the node's status.
    EndPlan,
    /// Turn the failure into `IgnoreFailed` and move on.
    Ignore,
    /// Turn the failure into `Succeeded` and move on.
    MarkSuccess,
}

/// Parameters of a retry adviser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAdviserParameters {
    /// Retries allowed after the first attempt.
    pub retry_count: u32,
    /// Wait before each retry, indexed by attempt; the last entry repeats.
    #[serde(default)]
    pub wait_intervals_ms: Vec<u64>,
    /// Computed waits, used when no explicit intervals are given.
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    /// Action once retries are exhausted.
    #[serde(default)]
    pub after_retry: AfterRetryAction,
    /// Node to move on to after the after-retry action.
    #[serde(default)]
    pub next_node_id: Option<String>,
    /// Statuses that trigger a retry; empty means any broken status.
    #[serde(default)]
    pub statuses: Vec<Status>,
}

impl RetryAdviserParameters {
    /// Creates parameters allowing `retry_count` retries with no wait.
    #[must_use]
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            wait_intervals_ms: Vec::new(),
            backoff: None,
            after_retry: AfterRetryAction::default(),
            next_node_id: None,
            statuses: Vec::new(),
        }
    }

    /// Sets the per-attempt wait intervals.
    #[must_use]
    pub fn with_wait_intervals_ms(mut self, intervals: Vec<u64>) -> Self {
        self.wait_intervals_ms = intervals;
        self
    }

    /// Sets a computed backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sets the after-retry action.
    #[must_use]
    pub fn with_after_retry(mut self, action: AfterRetryAction) -> Self {
        self.after_retry = action;
        self
    }

    /// Sets the node to move on to after the after-retry action.
    #[must_use]
    pub fn with_next_node(mut self, next_node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }

    /// Total attempts including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Returns true if the attempt at `retry_index` may be retried.
    #[must_use]
    pub fn has_budget(&self, retry_index: u32) -> bool {
        retry_index < self.retry_count
    }

    /// The wait before retrying the attempt at `retry_index`.
    #[must_use]
    pub fn wait_for(&self, retry_index: u32) -> Duration {
        if let Some(last) = self.wait_intervals_ms.last() {
            let idx = usize::try_from(retry_index).unwrap_or(usize::MAX);
            let ms = self.wait_intervals_ms.get(idx).unwrap_or(last);
            return Duration::from_millis(*ms);
        }
        self.backoff
            .as_ref()
            .map_or(Duration::ZERO, |b| b.base_delay(retry_index))
    }
}
