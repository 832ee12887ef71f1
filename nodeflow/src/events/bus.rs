//! The durable event bus between engine workers.
//!
//! Delivery is at-least-once: a read message stays in flight until it is
//! acknowledged, and is redelivered once its visibility timeout lapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::utils::generate_id;

/// Queues consumed by engine workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Node starts.
    NodeStart,
    /// Resumption of suspended nodes.
    NodeResume,
    /// Concluded nodes whose parent or plan must be re-evaluated.
    NodeConcluded,
    /// Interrupt processing.
    Interrupt,
    /// Fired timeouts.
    Timeout,
    /// Resource restraint promotion.
    Restraint,
}

impl Topic {
    /// All topics.
    pub const ALL: [Self; 6] = [
        Self::NodeStart,
        Self::NodeResume,
        Self::NodeConcluded,
        Self::Interrupt,
        Self::Timeout,
        Self::Restraint,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeStart => write!(f, "node_start"),
            Self::NodeResume => write!(f, "node_resume"),
            Self::NodeConcluded => write!(f, "node_concluded"),
            Self::Interrupt => write!(f, "interrupt"),
            Self::Timeout => write!(f, "timeout"),
            Self::Restraint => write!(f, "restraint"),
        }
    }
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: String,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub payload: serde_json::Value,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Number of times this message has been handed out.
    #[serde(default)]
    pub delivery_count: u32,
}

/// At-least-once message transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a payload, returning the message id.
    async fn publish(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Result<String>;

    /// Reads up to `max_messages`, waiting at most `poll_duration` for the
    /// first one.
    async fn read(&self, topic: Topic, max_messages: usize, poll_duration: Duration) -> Result<Vec<Message>>;

    /// Acknowledges a message so it is not redelivered.
    async fn acknowledge(&self, topic: Topic, message_id: &str) -> Result<()>;

    /// Messages not yet acknowledged (ready or in flight).
    async fn pending(&self, topic: Topic) -> Result<usize>;
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, (Message, Instant)>,
}

impl TopicQueue {
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((message, _)) = self.in_flight.remove(&id) {
                debug!(message_id = %id, "Redelivering unacknowledged message");
                self.ready.push_front(message);
            }
        }
    }
}

/// An in-process bus with visibility-timeout redelivery.
///
/// The bus can be switched unavailable to exercise consumer backoff.
#[derive(Debug)]
pub struct InMemoryEventBus {
    queues: Mutex<HashMap<Topic, TopicQueue>>,
    notify: Notify,
    visibility_timeout: Duration,
    available: AtomicBool,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryEventBus {
    /// Creates a bus with the given visibility timeout.
    #[must_use]
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            visibility_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    fn ensure_available(&self, topic: Topic) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::QueueUnavailable(format!("topic {topic}")))
        }
    }

    fn take_ready(&self, topic: Topic, max_messages: usize) -> Vec<Message> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let queue = queues.entry(topic).or_default();
        queue.requeue_expired(now);

        let mut out = Vec::new();
        while out.len() < max_messages {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            message.delivery_count += 1;
            queue
                .in_flight
                .insert(message.id.clone(), (message.clone(), now + self.visibility_timeout));
            out.push(message);
        }
        out
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        self.ensure_available(topic)?;
        let message = Message {
            id: generate_id(),
            timestamp: Utc::now(),
            payload,
            metadata,
            delivery_count: 0,
        };
        let id = message.id.clone();
        self.queues
            .lock()
            .entry(topic)
            .or_default()
            .ready
            .push_back(message);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read(&self, topic: Topic, max_messages: usize, poll_duration: Duration) -> Result<Vec<Message>> {
        let deadline = Instant::now() + poll_duration;
        loop {
            self.ensure_available(topic)?;

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.take_ready(topic, max_messages);
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, topic: Topic, message_id: &str) -> Result<()> {
        self.ensure_available(topic)?;
        if let Some(queue) = self.queues.lock().get_mut(&topic) {
            queue.in_flight.remove(message_id);
        }
        Ok(())
    }

    async fn pending(&self, topic: Topic) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .get(&topic)
            .map_or(0, |q| q.ready.len() + q.in_flight.len()))
    }
}
