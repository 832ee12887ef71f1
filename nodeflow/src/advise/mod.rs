//! Advisers: what happens after a node attempt completes.
//!
//! Each plan node carries an ordered list of [`AdviserObtainment`]s. When the
//! node concludes, the obtainments are evaluated in order and the first one
//! whose predicate matches produces the [`Advise`]. Built-in kinds are a sum
//! type; custom kinds are resolved through the [`Registry`].

mod retry;

pub use retry::{AfterRetryAction, RetryAdviserParameters};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{FailureInfo, NodeExecution, Status};
use crate::errors::EngineError;
use crate::registry::Registry;

/// Scope of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPhase {
    /// Roll back the failed step only.
    Step,
    /// Roll back the enclosing stage.
    #[default]
    Stage,
    /// Roll back the whole pipeline.
    Pipeline,
}

/// The decision produced by an adviser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Advise {
    /// Continue with a sibling, or return to the parent when `None`.
    NextStep {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
    },
    /// Run the node again as a new attempt.
    Retry {
        /// Total attempts allowed.
        max_attempts: u32,
        /// Wait before the new attempt starts.
        wait_interval_ms: u64,
    },
    /// Record the node as succeeded, then continue.
    MarkSuccess {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
    },
    /// Stop the plan with the node's status.
    EndPlan,
    /// Start a rollback section.
    Rollback {
        /// Rollback scope.
        phase: RollbackPhase,
        /// Plan node id of the rollback section.
        rollback_node_id: String,
    },
    /// Record the node as ignore-failed, then continue.
    Ignore {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
    },
}

impl Advise {
    /// Continue with `next_node_id`.
    #[must_use]
    pub fn next(next_node_id: Option<String>) -> Self {
        Self::NextStep { next_node_id }
    }

    /// The wait before a retry, if this is a retry advise.
    #[must_use]
    pub fn retry_wait(&self) -> Option<Duration> {
        match self {
            Self::Retry {
                wait_interval_ms, ..
            } => Some(Duration::from_millis(*wait_interval_ms)),
            _ => None,
        }
    }
}

/// Input to advisers.
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    /// The concluded node.
    pub node_execution: NodeExecution,
    /// Status before conclusion.
    pub from_status: Status,
    /// Status the node concluded with.
    pub to_status: Status,
}

impl AdvisingEvent {
    /// Creates an event for `node_execution`, which is already in its
    /// concluded status.
    #[must_use]
    pub fn new(node_execution: NodeExecution, from_status: Status) -> Self {
        let to_status = node_execution.status;
        Self {
            node_execution,
            from_status,
            to_status,
        }
    }

    /// Failure details of the concluded node.
    #[must_use]
    pub fn failure_info(&self) -> Option<&FailureInfo> {
        self.node_execution.failure_info.as_ref()
    }

    /// Retry index of the concluded attempt.
    #[must_use]
    pub fn retry_index(&self) -> u32 {
        self.node_execution.retry_index()
    }
}

/// A custom adviser registered by name.
pub trait Adviser: Send + Sync {
    /// Returns true if this adviser applies to `event`.
    fn can_advise(&self, event: &AdvisingEvent, parameters: &serde_json::Value) -> bool;

    /// Produces the advise. `None` falls through to the next obtainment.
    fn on_advise(&self, event: &AdvisingEvent, parameters: &serde_json::Value) -> Option<Advise>;
}

/// Adviser configuration attached to a plan node.
///
/// Empty `statuses` lists mean the kind's default: positive statuses for
/// `NextStep`, broken statuses for everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AdviserObtainment {
    /// Continue with a sibling on success.
    NextStep {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// Continue with a sibling (or stop the chain) on failure.
    OnFail {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// Retry on failure.
    Retry(RetryAdviserParameters),
    /// Convert the failure to success.
    MarkSuccess {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// Ignore the failure.
    Ignore {
        /// Plan node id of the next sibling.
        next_node_id: Option<String>,
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// End the plan.
    EndPlan {
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// Start a rollback section.
    Rollback {
        /// Rollback scope.
        #[serde(default)]
        phase: RollbackPhase,
        /// Plan node id of the rollback section.
        rollback_node_id: String,
        /// Matching statuses.
        #[serde(default)]
        statuses: Vec<Status>,
    },
    /// An adviser resolved through the registry.
    Custom {
        /// Registered adviser name.
        adviser_type: String,
        /// Adviser parameters.
        #[serde(default)]
        parameters: serde_json::Value,
    },
}

fn matches(statuses: &[Status], status: Status, default: fn(&Status) -> bool) -> bool {
    if statuses.is_empty() {
        default(&status)
    } else {
        statuses.contains(&status)
    }
}

impl AdviserObtainment {
    /// Continue with `next_node_id` on success.
    #[must_use]
    pub fn next_step(next_node_id: impl Into<String>) -> Self {
        Self::NextStep {
            next_node_id: Some(next_node_id.into()),
            statuses: Vec::new(),
        }
    }

    /// Continue with `next_node_id` on failure.
    #[must_use]
    pub fn on_fail(next_node_id: Option<String>) -> Self {
        Self::OnFail {
            next_node_id,
            statuses: Vec::new(),
        }
    }

    /// Retry on failure.
    #[must_use]
    pub fn retry(parameters: RetryAdviserParameters) -> Self {
        Self::Retry(parameters)
    }

    /// Ignore failures, then continue with `next_node_id`.
    #[must_use]
    pub fn ignore(next_node_id: Option<String>) -> Self {
        Self::Ignore {
            next_node_id,
            statuses: Vec::new(),
        }
    }

    /// Mark failures as success, then continue with `next_node_id`.
    #[must_use]
    pub fn mark_success(next_node_id: Option<String>) -> Self {
        Self::MarkSuccess {
            next_node_id,
            statuses: Vec::new(),
        }
    }

    /// End the plan on failure.
    #[must_use]
    pub fn end_plan() -> Self {
        Self::EndPlan {
            statuses: Vec::new(),
        }
    }

    /// Roll back on failure.
    #[must_use]
    pub fn rollback(phase: RollbackPhase, rollback_node_id: impl Into<String>) -> Self {
        Self::Rollback {
            phase,
            rollback_node_id: rollback_node_id.into(),
            statuses: Vec::new(),
        }
    }

    /// Plan node ids this obtainment may route to.
    #[must_use]
    pub fn referenced_node_ids(&self) -> Vec<&str> {
        match self {
            Self::NextStep { next_node_id, .. }
            | Self::OnFail { next_node_id, .. }
            | Self::MarkSuccess { next_node_id, .. }
            | Self::Ignore { next_node_id, .. } => next_node_id.as_deref().into_iter().collect(),
            Self::Retry(params) => params.next_node_id.as_deref().into_iter().collect(),
            Self::Rollback {
                rollback_node_id, ..
            } => vec![rollback_node_id.as_str()],
            Self::EndPlan { .. } | Self::Custom { .. } => Vec::new(),
        }
    }

    /// Evaluates this obtainment. `None` means its predicate did not match.
    ///
    /// # Errors
    ///
    /// Returns an error if a custom adviser type is not registered.
    pub fn advise(
        &self,
        event: &AdvisingEvent,
        registry: &Registry,
    ) -> Result<Option<Advise>, EngineError> {
        let status = event.to_status;
        let advise = match self {
            Self::NextStep {
                next_node_id,
                statuses,
            } => matches(statuses, status, Status::is_positive)
                .then(|| Advise::next(next_node_id.clone())),
            Self::OnFail {
                next_node_id,
                statuses,
            } => matches(statuses, status, Status::is_broken)
                .then(|| Advise::next(next_node_id.clone())),
            Self::Retry(params) => {
                if matches(&params.statuses, status, Status::is_broken) {
                    Some(Self::retry_advise(params, event.retry_index()))
                } else {
                    None
                }
            }
            Self::MarkSuccess {
                next_node_id,
                statuses,
            } => matches(statuses, status, Status::is_broken).then(|| Advise::MarkSuccess {
                next_node_id: next_node_id.clone(),
            }),
            Self::Ignore {
                next_node_id,
                statuses,
            } => matches(statuses, status, Status::is_broken).then(|| Advise::Ignore {
                next_node_id: next_node_id.clone(),
            }),
            Self::EndPlan { statuses } => {
                matches(statuses, status, Status::is_broken).then_some(Advise::EndPlan)
            }
            Self::Rollback {
                phase,
                rollback_node_id,
                statuses,
            } => matches(statuses, status, Status::is_broken).then(|| Advise::Rollback {
                phase: *phase,
                rollback_node_id: rollback_node_id.clone(),
            }),
            Self::Custom {
                adviser_type,
                parameters,
            } => {
                let adviser = registry.adviser(adviser_type)?;
                if adviser.can_advise(event, parameters) {
                    adviser.on_advise(event, parameters)
                } else {
                    None
                }
            }
        };
        Ok(advise)
    }

    fn retry_advise(params: &RetryAdviserParameters, retry_index: u32) -> Advise {
        if params.has_budget(retry_index) {
            #[allow(clippy::cast_possible_truncation)]
            let wait_interval_ms = params.wait_for(retry_index).as_millis() as u64;
            return Advise::Retry {
                max_attempts: params.max_attempts(),
                wait_interval_ms,
            };
        }

        let next_node_id = params.next_node_id.clone();
        match params.after_retry {
            AfterRetryAction::Proceed => Advise::NextStep { next_node_id },
            AfterRetryAction::EndPlan => Advise::EndPlan,
            AfterRetryAction::Ignore => Advise::Ignore { next_node_id },
            AfterRetryAction::MarkSuccess => Advise::MarkSuccess { next_node_id },
        }
    }
}

/// Evaluates `obtainments` in order; the first matching one wins.
///
/// # Errors
///
/// Returns an error if a custom adviser type is not registered.
pub fn evaluate(
    obtainments: &[AdviserObtainment],
    event: &AdvisingEvent,
    registry: &Registry,
) -> Result<Option<Advise>, EngineError> {
    for obtainment in obtainments {
        if let Some(advise) = obtainment.advise(event, registry)? {
            return Ok(Some(advise));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ambiance, Level, PlanNode};
    use chrono::Utc;
    use std::sync::Arc;

    fn event(status: Status, retry_index: u32) -> AdvisingEvent {
        let plan_node = PlanNode::new("step-a", "Shell");
        let ambiance = Ambiance::new("pe1", "p1")
            .clone_for_child(Level::for_node("rt-a", &plan_node, retry_index, Utc::now()));
        let mut node = NodeExecution::new(ambiance, Utc::now());
        node.status = status;
        AdvisingEvent::new(node, Status::Running)
    }

    #[test]
    fn test_first_match_wins() {
        let registry = Registry::new();
        let obtainments = vec![
            AdviserObtainment::on_fail(Some("cleanup".into())),
            AdviserObtainment::next_step("b"),
        ];

        let on_success = evaluate(&obtainments, &event(Status::Succeeded, 0), &registry).unwrap();
        assert_eq!(on_success, Some(Advise::next(Some("b".into()))));

        let on_failure = evaluate(&obtainments, &event(Status::Failed, 0), &registry).unwrap();
        assert_eq!(on_failure, Some(Advise::next(Some("cleanup".into()))));
    }

    #[test]
    fn test_no_match_returns_none() {
        let registry = Registry::new();
        let obtainments = vec![AdviserObtainment::next_step("b")];
        assert_eq!(evaluate(&obtainments, &event(Status::Failed, 0), &registry).unwrap(), None);
    }

    #[test]
    fn test_retry_until_budget_then_after_retry() {
        let registry = Registry::new();
        let obtainments = vec![AdviserObtainment::retry(
            RetryAdviserParameters::new(2)
                .with_wait_intervals_ms(vec![1000])
                .with_after_retry(AfterRetryAction::Ignore),
        )];

        let first = evaluate(&obtainments, &event(Status::Failed, 0), &registry).unwrap();
        assert_eq!(
            first,
            Some(Advise::Retry {
                max_attempts: 3,
                wait_interval_ms: 1000
            })
        );
        assert_eq!(first.unwrap().retry_wait(), Some(Duration::from_secs(1)));

        let exhausted = evaluate(&obtainments, &event(Status::Errored, 2), &registry).unwrap();
        assert_eq!(exhausted, Some(Advise::Ignore { next_node_id: None }));
    }

    #[test]
    fn test_explicit_statuses_override_default() {
        let registry = Registry::new();
        let obtainments = vec![AdviserObtainment::EndPlan {
            statuses: vec![Status::Expired],
        }];

        assert_eq!(evaluate(&obtainments, &event(Status::Failed, 0), &registry).unwrap(), None);
        assert_eq!(
            evaluate(&obtainments, &event(Status::Expired, 0), &registry).unwrap(),
            Some(Advise::EndPlan)
        );
    }

    struct AlwaysEndPlan;

    impl Adviser for AlwaysEndPlan {
        fn can_advise(&self, event: &AdvisingEvent, parameters: &serde_json::Value) -> bool {
            parameters["on"] == serde_json::json!(event.to_status.to_string())
        }

        fn on_advise(&self, _event: &AdvisingEvent, _parameters: &serde_json::Value) -> Option<Advise> {
            Some(Advise::EndPlan)
        }
    }

    #[test]
    fn test_custom_adviser() {
        let registry = Registry::new().with_adviser("end-on", Arc::new(AlwaysEndPlan));
        let obtainments = vec![AdviserObtainment::Custom {
            adviser_type: "end-on".into(),
            parameters: serde_json::json!({"on": "expired"}),
        }];

        assert_eq!(evaluate(&obtainments, &event(Status::Failed, 0), &registry).unwrap(), None);
        assert_eq!(
            evaluate(&obtainments, &event(Status::Expired, 0), &registry).unwrap(),
            Some(Advise::EndPlan)
        );
    }

    #[test]
    fn test_unknown_custom_adviser_errors() {
        let registry = Registry::new();
        let obtainments = vec![AdviserObtainment::Custom {
            adviser_type: "nope".into(),
            parameters: serde_json::Value::Null,
        }];
        assert!(evaluate(&obtainments, &event(Status::Failed, 0), &registry).is_err());
    }

    #[test]
    fn test_obtainment_serde() {
        let json = serde_json::json!({"type": "rollback", "rollback_node_id": "rb"});
        let obtainment: AdviserObtainment = serde_json::from_value(json).unwrap();
        assert_eq!(obtainment, AdviserObtainment::rollback(RollbackPhase::Stage, "rb"));
        assert_eq!(obtainment.referenced_node_ids(), vec!["rb"]);
    }
}
