//! Interrupt records and their persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::errors::Result;

/// Control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort one node and its descendants.
    Abort,
    /// Abort the whole plan.
    AbortAll,
    /// Pause one node.
    Pause,
    /// Pause the whole plan.
    PauseAll,
    /// Resume one node.
    Resume,
    /// Resume the whole plan.
    ResumeAll,
    /// Retry a failed node.
    Retry,
    /// Expire a node (raised by the timeout engine).
    MarkExpired,
    /// Force a node to succeed.
    MarkSuccess,
    /// Force a node to fail.
    MarkFailed,
}

impl InterruptType {
    /// Returns true for types that address the whole plan.
    #[must_use]
    pub fn is_plan_scoped(&self) -> bool {
        matches!(self, Self::AbortAll | Self::PauseAll | Self::ResumeAll)
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Abort => "ABORT",
            Self::AbortAll => "ABORT_ALL",
            Self::Pause => "PAUSE",
            Self::PauseAll => "PAUSE_ALL",
            Self::Resume => "RESUME",
            Self::ResumeAll => "RESUME_ALL",
            Self::Retry => "RETRY",
            Self::MarkExpired => "MARK_EXPIRED",
            Self::MarkSuccess => "MARK_SUCCESS",
            Self::MarkFailed => "MARK_FAILED",
        };
        f.write_str(name)
    }
}

/// Processing state of an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    /// Persisted, waiting to be processed.
    Registered,
    /// Claimed by a worker.
    Processing,
    /// Applied.
    ProcessedSuccessfully,
    /// Could not be applied.
    ProcessedUnsuccessfully,
    /// Dropped before processing.
    Discarded,
}

impl InterruptState {
    /// Returns true until processing has finished.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Registered | Self::Processing)
    }
}

impl fmt::Display for InterruptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registered => "REGISTERED",
            Self::Processing => "PROCESSING",
            Self::ProcessedSuccessfully => "PROCESSED_SUCCESSFULLY",
            Self::ProcessedUnsuccessfully => "PROCESSED_UNSUCCESSFULLY",
            Self::Discarded => "DISCARDED",
        };
        f.write_str(name)
    }
}

/// A persisted control signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Interrupt id.
    pub uuid: String,
    /// Target plan execution.
    pub plan_execution_id: String,
    /// Signal.
    pub interrupt_type: InterruptType,
    /// Target node; `None` for plan-scoped signals.
    #[serde(default)]
    pub node_execution_id: Option<String>,
    /// Processing state.
    pub state: InterruptState,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata (issuer, reason).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Hash of (plan, type, node) used to collapse duplicates.
    pub dedupe_key: String,
}

/// Storage for interrupts.
#[async_trait]
pub trait InterruptStore: Send + Sync {
    /// Inserts `interrupt` unless an active interrupt shares its dedupe key.
    /// Returns the stored interrupt, which is the existing one on a
    /// duplicate.
    async fn register(&self, interrupt: Interrupt) -> Result<Interrupt>;

    /// Reads an interrupt.
    async fn get(&self, interrupt_id: &str) -> Result<Option<Interrupt>>;

    /// Moves an interrupt from `expected` to `state`. Returns false if it was
    /// not in `expected`.
    async fn compare_and_set_state(
        &self,
        interrupt_id: &str,
        expected: InterruptState,
        state: InterruptState,
    ) -> Result<bool>;

    /// Interrupts of a plan execution in registration order.
    async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>>;
}

/// Interrupts behind one lock.
#[derive(Debug, Default)]
pub struct InMemoryInterruptStore {
    interrupts: Mutex<Vec<Interrupt>>,
}

impl InMemoryInterruptStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterruptStore for InMemoryInterruptStore {
    async fn register(&self, interrupt: Interrupt) -> Result<Interrupt> {
        let mut interrupts = self.interrupts.lock();
        if let Some(existing) = interrupts
            .iter()
            .find(|i| i.dedupe_key == interrupt.dedupe_key && i.state.is_active())
        {
            return Ok(existing.clone());
        }
        interrupts.push(interrupt.clone());
        Ok(interrupt)
    }

    async fn get(&self, interrupt_id: &str) -> Result<Option<Interrupt>> {
        Ok(self
            .interrupts
            .lock()
            .iter()
            .find(|i| i.uuid == interrupt_id)
            .cloned())
    }

    async fn compare_and_set_state(
        &self,
        interrupt_id: &str,
        expected: InterruptState,
        state: InterruptState,
    ) -> Result<bool> {
        let mut interrupts = self.interrupts.lock();
        match interrupts.iter_mut().find(|i| i.uuid == interrupt_id) {
            Some(interrupt) if interrupt.state == expected => {
                interrupt.state = state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        Ok(self
            .interrupts
            .lock()
            .iter()
            .filter(|i| i.plan_execution_id == plan_execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interrupt(id: &str, key: &str) -> Interrupt {
        Interrupt {
            uuid: id.to_string(),
            plan_execution_id: "pe".to_string(),
            interrupt_type: InterruptType::Abort,
            node_execution_id: Some("n1".to_string()),
            state: InterruptState::Registered,
            created_at: Utc::now(),
            metadata: HashMap::new(),
            dedupe_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_collapses_active_duplicates() {
        let store = InMemoryInterruptStore::new();
        assert_eq!(store.register(interrupt("i1", "k")).await.unwrap().uuid, "i1");
        assert_eq!(store.register(interrupt("i2", "k")).await.unwrap().uuid, "i1");

        store
            .compare_and_set_state("i1", InterruptState::Registered, InterruptState::ProcessedSuccessfully)
            .await
            .unwrap();
        assert_eq!(store.register(interrupt("i3", "k")).await.unwrap().uuid, "i3");
        assert_eq!(store.list_by_plan("pe").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_set_state() {
        let store = InMemoryInterruptStore::new();
        store.register(interrupt("i1", "k")).await.unwrap();

        assert!(store
            .compare_and_set_state("i1", InterruptState::Registered, InterruptState::Processing)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_state("i1", InterruptState::Registered, InterruptState::Processing)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_state("missing", InterruptState::Registered, InterruptState::Processing)
            .await
            .unwrap());
    }

    #[test]
    fn test_type_serde_names() {
        assert_eq!(serde_json::to_value(InterruptType::AbortAll).unwrap(), "ABORT_ALL");
        assert_eq!(InterruptType::MarkExpired.to_string(), "MARK_EXPIRED");
        assert!(InterruptType::ResumeAll.is_plan_scoped());
        assert!(!InterruptType::Retry.is_plan_scoped());
    }
}
