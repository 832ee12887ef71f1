//! Timeout trackers.
//!
//! A tracker turns elapsed-time signals into a deadline. Trackers are plain
//! serializable values so a timeout instance survives restarts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Signals a tracker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutEvent {
    /// The tracked node was paused.
    Pause,
    /// The tracked node was resumed.
    Resume,
}

/// Computes a deadline from time signals.
pub trait TimeoutTracker {
    /// Applies a signal received at `at`.
    fn on_event(&mut self, event: TimeoutEvent, at: DateTime<Utc>);

    /// Current deadline; `None` while the clock is stopped or when the
    /// deadline lies beyond the representable range.
    fn expires_at(&self) -> Option<DateTime<Utc>>;

    /// Returns true if the deadline has passed at `now`.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| deadline <= now)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    Duration::try_milliseconds(i64::try_from(ms).ok()?)
}

/// Wall-clock deadline from a fixed start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsoluteTimeoutTracker {
    /// When counting started.
    pub start: DateTime<Utc>,
    /// Allowed duration.
    pub timeout_ms: u64,
}

impl AbsoluteTimeoutTracker {
    /// Creates a tracker starting at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, timeout_ms: u64) -> Self {
        Self { start, timeout_ms }
    }
}

impl TimeoutTracker for AbsoluteTimeoutTracker {
    fn on_event(&mut self, _event: TimeoutEvent, _at: DateTime<Utc>) {}

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.start.checked_add_signed(millis(self.timeout_ms)?)
    }
}

/// Counts only time spent running; paused time is not charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTimeoutTracker {
    /// Allowed running duration.
    pub timeout_ms: u64,
    /// Running time already consumed, in milliseconds.
    pub consumed_ms: i64,
    /// Start of the current running stretch; `None` while paused.
    pub running_since: Option<DateTime<Utc>>,
}

impl ActiveTimeoutTracker {
    /// Creates a running tracker started at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            consumed_ms: 0,
            running_since: Some(start),
        }
    }
}

impl TimeoutTracker for ActiveTimeoutTracker {
    fn on_event(&mut self, event: TimeoutEvent, at: DateTime<Utc>) {
        match (event, self.running_since) {
            (TimeoutEvent::Pause, Some(since)) => {
                self.consumed_ms = self
                    .consumed_ms
                    .saturating_add((at - since).num_milliseconds().max(0));
                self.running_since = None;
            }
            (TimeoutEvent::Resume, None) => self.running_since = Some(at),
            _ => {}
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        let since = self.running_since?;
        since
            .checked_add_signed(millis(self.timeout_ms)?)?
            .checked_sub_signed(Duration::try_milliseconds(self.consumed_ms)?)
    }
}

/// Tracker kinds a plan can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    /// Wall clock.
    #[default]
    Absolute,
    /// Running time only.
    Active,
}

/// A persisted tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TrackerState {
    /// Wall clock.
    Absolute(AbsoluteTimeoutTracker),
    /// Running time only.
    Active(ActiveTimeoutTracker),
}

impl TrackerState {
    /// Builds a tracker of `kind` starting at `start`.
    #[must_use]
    pub fn start(kind: TrackerKind, start: DateTime<Utc>, timeout_ms: u64) -> Self {
        match kind {
            TrackerKind::Absolute => Self::Absolute(AbsoluteTimeoutTracker::new(start, timeout_ms)),
            TrackerKind::Active => Self::Active(ActiveTimeoutTracker::new(start, timeout_ms)),
        }
    }
}

impl TimeoutTracker for TrackerState {
    fn on_event(&mut self, event: TimeoutEvent, at: DateTime<Utc>) {
        match self {
            Self::Absolute(t) => t.on_event(event, at),
            Self::Active(t) => t.on_event(event, at),
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Absolute(t) => t.expires_at(),
            Self::Active(t) => t.expires_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_ignores_pause() {
        let start = Utc::now();
        let mut tracker = TrackerState::start(TrackerKind::Absolute, start, 1000);
        tracker.on_event(TimeoutEvent::Pause, start);

        assert!(!tracker.is_expired(start + Duration::milliseconds(999)));
        assert!(tracker.is_expired(start + Duration::milliseconds(1000)));
    }

    #[test]
    fn test_active_stops_while_paused() {
        let start = Utc::now();
        let mut tracker = TrackerState::start(TrackerKind::Active, start, 1000);

        tracker.on_event(TimeoutEvent::Pause, start + Duration::milliseconds(400));
        assert_eq!(tracker.expires_at(), None);
        assert!(!tracker.is_expired(start + Duration::milliseconds(10_000)));

        let resumed = start + Duration::milliseconds(5000);
        tracker.on_event(TimeoutEvent::Resume, resumed);
        assert_eq!(tracker.expires_at(), Some(resumed + Duration::milliseconds(600)));
        assert!(!tracker.is_expired(resumed + Duration::milliseconds(599)));
        assert!(tracker.is_expired(resumed + Duration::milliseconds(600)));
    }

    #[test]
    fn test_active_repeated_signals_are_harmless() {
        let start = Utc::now();
        let mut tracker = ActiveTimeoutTracker::new(start, 1000);
        tracker.on_event(TimeoutEvent::Resume, start + Duration::milliseconds(100));
        assert_eq!(tracker.running_since, Some(start));

        tracker.on_event(TimeoutEvent::Pause, start + Duration::milliseconds(100));
        tracker.on_event(TimeoutEvent::Pause, start + Duration::milliseconds(900));
        assert_eq!(tracker.consumed_ms, 100);
    }

    #[test]
    fn test_out_of_range_deadline_never_expires() {
        let start = Utc::now();
        for kind in [TrackerKind::Absolute, TrackerKind::Active] {
            let tracker = TrackerState::start(kind, start, u64::MAX);
            assert_eq!(tracker.expires_at(), None, "{kind:?}");
            assert!(!tracker.is_expired(DateTime::<Utc>::MAX_UTC), "{kind:?}");
        }

        let far = AbsoluteTimeoutTracker::new(start, 1 << 62);
        assert_eq!(far.expires_at(), None);
    }

    #[test]
    fn test_tracker_state_serde() {
        let start = Utc::now();
        let tracker = TrackerState::start(TrackerKind::Active, start, 5);
        let json = serde_json::to_value(&tracker).unwrap();
        assert_eq!(json["kind"], "active");
        let back: TrackerState = serde_json::from_value(json).unwrap();
        assert_eq!(back, tracker);
    }
}
