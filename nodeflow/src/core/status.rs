//! Node execution status and the transition graph between statuses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a node execution (or of a whole plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, not yet facilitated.
    Queued,
    /// Being executed (or waiting for its children).
    Running,
    /// Waiting on an external callback or paused.
    Suspended,
    /// An abort is propagating; converges to `Aborted`.
    Discontinuing,
    /// Completed successfully.
    Succeeded,
    /// Completed with a step failure.
    Failed,
    /// Completed with an engine-side error.
    Errored,
    /// Deadline passed before completion.
    Expired,
    /// Aborted by an interrupt.
    Aborted,
    /// Skipped by its skip condition.
    Skipped,
    /// Failed, but the failure was ignored by an adviser.
    IgnoreFailed,
}

impl Default for Status {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Discontinuing => write!(f, "discontinuing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
            Self::Expired => write!(f, "expired"),
            Self::Aborted => write!(f, "aborted"),
            Self::Skipped => write!(f, "skipped"),
            Self::IgnoreFailed => write!(f, "ignore_failed"),
        }
    }
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Queued,
        Self::Running,
        Self::Suspended,
        Self::Discontinuing,
        Self::Succeeded,
        Self::Failed,
        Self::Errored,
        Self::Expired,
        Self::Aborted,
        Self::Skipped,
        Self::IgnoreFailed,
    ];

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed
                | Self::Errored
                | Self::Expired
                | Self::Aborted
                | Self::Skipped
                | Self::IgnoreFailed
        )
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::IgnoreFailed)
    }

    /// Returns true if the status is a broken (failure) terminal status.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Failed | Self::Errored | Self::Expired)
    }

    /// Statuses from which a manual or advised retry is allowed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }

    /// Returns true if the status graph allows `self -> to`.
    ///
    /// Terminal statuses never move back to a non-terminal one. The only
    /// terminal-to-terminal corrections are advised ones: a broken status may
    /// become `Succeeded` (mark success) or `IgnoreFailed` (ignore failure).
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        use Status::{
            Aborted, Discontinuing, Errored, Expired, Failed, IgnoreFailed, Queued, Running,
            Skipped, Succeeded, Suspended,
        };

        match (self, to) {
            (Queued, Running | Suspended | Skipped | Discontinuing | Aborted | Errored | Expired) => {
                true
            }
            (
                Running,
                Suspended | Discontinuing | Succeeded | Failed | Errored | Expired | Aborted
                | Skipped,
            ) => true,
            (
                Suspended,
                Running | Discontinuing | Succeeded | Failed | Errored | Expired | Aborted,
            ) => true,
            (Discontinuing, Aborted) => true,
            (Failed | Errored | Expired, Succeeded | IgnoreFailed) => true,
            _ => false,
        }
    }

    /// Severity rank used by the worst-status-wins reduction.
    ///
    /// ABORTED > FAILED > ERRORED > EXPIRED > SUCCEEDED > SKIPPED.
    #[must_use]
    pub fn severity(&self) -> u8 {
        match self {
            Self::Aborted | Self::Discontinuing => 5,
            Self::Failed => 4,
            Self::Errored => 3,
            Self::Expired => 2,
            Self::Succeeded
            | Self::IgnoreFailed
            | Self::Queued
            | Self::Running
            | Self::Suspended => 1,
            Self::Skipped => 0,
        }
    }
}

/// Reduces terminal child statuses to a parent status, worst status wins.
///
/// `IgnoreFailed` counts as `Succeeded`; `Skipped` is a pass-through that only
/// surfaces when every child was skipped. An empty set reduces to `Succeeded`.
#[must_use]
pub fn worst_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let worst = statuses
        .into_iter()
        .max_by_key(Status::severity);

    match worst {
        None => Status::Succeeded,
        Some(Status::Discontinuing) => Status::Aborted,
        Some(Status::Skipped) => Status::Skipped,
        Some(status) if status.severity() == 1 => Status::Succeeded,
        Some(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Succeeded.to_string(), "succeeded");
        assert_eq!(Status::Discontinuing.to_string(), "discontinuing");
        assert_eq!(Status::IgnoreFailed.to_string(), "ignore_failed");
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(Status::Aborted.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Suspended.is_terminal());
        assert!(!Status::Discontinuing.is_terminal());
    }

    #[test]
    fn test_terminal_never_resurrects() {
        for from in Status::ALL.iter().filter(|s| s.is_terminal()) {
            for to in Status::ALL.iter().filter(|s| !s.is_terminal()) {
                assert!(
                    !from.can_transition_to(*to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_discontinuing_only_reaches_aborted() {
        for to in Status::ALL {
            assert_eq!(
                Status::Discontinuing.can_transition_to(to),
                to == Status::Aborted
            );
        }
    }

    #[test]
    fn test_pause_resume_edges() {
        assert!(Status::Running.can_transition_to(Status::Suspended));
        assert!(Status::Suspended.can_transition_to(Status::Running));
        assert!(!Status::Succeeded.can_transition_to(Status::Suspended));
    }

    #[test]
    fn test_advised_corrections() {
        assert!(Status::Failed.can_transition_to(Status::Succeeded));
        assert!(Status::Errored.can_transition_to(Status::IgnoreFailed));
        assert!(!Status::Aborted.can_transition_to(Status::Succeeded));
        assert!(!Status::Succeeded.can_transition_to(Status::Failed));
    }

    #[test]
    fn test_worst_status_wins() {
        use Status::*;
        assert_eq!(worst_status([Succeeded, Failed, Aborted]), Aborted);
        assert_eq!(worst_status([Succeeded, Errored, Failed]), Failed);
        assert_eq!(worst_status([Expired, Errored]), Errored);
        assert_eq!(worst_status([Succeeded, Expired]), Expired);
        assert_eq!(worst_status([Succeeded, Skipped]), Succeeded);
        assert_eq!(worst_status([IgnoreFailed, Skipped]), Succeeded);
        assert_eq!(worst_status([Skipped, Skipped]), Skipped);
        assert_eq!(worst_status([]), Succeeded);
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&Status::IgnoreFailed).unwrap();
        assert_eq!(json, r#""ignore_failed""#);

        let status: Status = serde_json::from_str(r#""discontinuing""#).unwrap();
        assert_eq!(status, Status::Discontinuing);
    }
}
