//! Long-running consumers: one per topic, plus the timeout poller.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::cancellation::{CancellationToken, WorkerGroup};
use crate::events::Topic;
use crate::utils::BackoffState;

impl Engine {
    /// Spawns a consumer per topic and the timeout poller.
    ///
    /// Stop them with [`WorkerGroup::shutdown`]; in-flight units of work
    /// finish first, anything unacknowledged is redelivered later.
    #[must_use]
    pub fn spawn_workers(&self) -> WorkerGroup {
        let group = WorkerGroup::new();
        for topic in Topic::ALL {
            let engine = self.clone();
            group.spawn(format!("consumer:{topic}"), move |token| async move {
                engine.consume(topic, token).await;
            });
        }
        let engine = self.clone();
        group.spawn("timeout-poller", move |token| async move {
            engine.poll_timeouts(token).await;
        });
        group
    }

    async fn consume(&self, topic: Topic, token: Arc<CancellationToken>) {
        let consumer = &self.config.consumer;
        let mut backoff = BackoffState::new();
        info!(topic = %topic, "Consumer started");

        while !token.is_cancelled() {
            let read = tokio::select! {
                () = token.cancelled() => break,
                read = self.bus.read(topic, consumer.batch_size, consumer.poll_duration()) => read,
            };

            let messages = match read {
                Ok(messages) => {
                    backoff.reset();
                    messages
                }
                Err(err) if err.is_transient() => {
                    let delay = backoff.next_delay(&consumer.backoff);
                    warn!(
                        topic = %topic,
                        attempt = backoff.attempt(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Bus unavailable; backing off"
                    );
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(err) => {
                    error!(topic = %topic, error = %err, "Consumer read failed");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(consumer.poll_duration()) => continue,
                    }
                }
            };

            for message in &messages {
                if let Err(err) = self.handle_delivery(topic, message).await {
                    debug!(
                        topic = %topic,
                        message_id = %message.id,
                        error = %err,
                        "Leaving message for redelivery"
                    );
                }
            }
        }
        info!(topic = %topic, reason = ?token.reason(), "Consumer stopped");
    }

    async fn poll_timeouts(&self, token: Arc<CancellationToken>) {
        let interval = self.config.timeout_poll_interval();
        let mut backoff = BackoffState::new();

        while !token.is_cancelled() {
            let delay = match self.timeouts.fire_due().await {
                Ok(fired) => {
                    if fired > 0 {
                        debug!(fired, "Fired timeouts");
                    }
                    backoff.reset();
                    interval
                }
                Err(err) => {
                    warn!(error = %err, "Timeout poll failed");
                    backoff.next_delay(&self.config.consumer.backoff).max(interval)
                }
            };
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        info!("Timeout poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{ConsumerConfig, EngineConfig};
    use crate::core::{Ambiance, Status};
    use crate::engine::EnginePersistence;
    use crate::events::{EventBus, InMemoryEventBus};
    use crate::testing::{fixture_registry, linear_plan, MockStep};
    use crate::utils::BackoffPolicy;

    async fn queued(bus: &InMemoryEventBus) -> usize {
        let mut total = 0;
        for topic in Topic::ALL {
            total += bus.pending(topic).await.unwrap();
        }
        total
    }

    #[tokio::test]
    async fn test_workers_ride_out_bus_outage() {
        let config = EngineConfig::default()
            .with_consumer(ConsumerConfig {
                batch_size: 10,
                poll_duration_ms: 20,
                backoff: BackoffPolicy {
                    base_delay_ms: 5,
                    max_delay_ms: 20,
                    ..BackoffPolicy::default()
                },
            })
            .with_timeout_poll_interval_ms(10);
        let bus = Arc::new(InMemoryEventBus::new(Duration::from_secs(30)));
        let persistence = EnginePersistence {
            bus: bus.clone(),
            ..EnginePersistence::in_memory(&config)
        };
        let shell = Arc::new(MockStep::new("Shell"));
        let engine = Engine::builder()
            .with_config(config)
            .with_registry(fixture_registry().with_step(shell.clone()))
            .with_persistence(persistence)
            .build();

        let pe = engine
            .start_plan(linear_plan("p1", "Shell", &["a", "b"]), Ambiance::new("p1-run", "p1"))
            .await
            .unwrap();
        assert!(queued(&bus).await > 0);

        bus.set_available(false);
        let workers = engine.spawn_workers();
        assert_eq!(workers.len(), Topic::ALL.len() + 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let execution = engine.plan_execution(&pe).await.unwrap().unwrap();
        assert_eq!(execution.status, Status::Running);
        assert!(shell.recorded_nodes().is_empty());

        bus.set_available(true);
        let mut status = execution.status;
        for _ in 0..200 {
            status = engine.plan_execution(&pe).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Status::Succeeded);
        assert_eq!(shell.recorded_nodes().len(), 2);

        assert_eq!(workers.shutdown("test finished").await, Vec::<String>::new());
        assert!(workers.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let engine = Engine::builder().with_registry(fixture_registry()).build();
        let workers = engine.spawn_workers();

        let failed = tokio::time::timeout(Duration::from_secs(5), workers.shutdown("done"))
            .await
            .unwrap();
        assert_eq!(failed, Vec::<String>::new());
    }
}
