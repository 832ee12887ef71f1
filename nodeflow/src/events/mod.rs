//! The event bus, engine messages and orchestration event sinks.

mod bus;
mod message;
mod sink;

pub use bus::{EventBus, InMemoryEventBus, Message, Topic};
pub use message::{EngineMessage, StartNodeRequest};
pub use sink::{
    CollectingEventSink, LoggingEventSink, NoOpEventSink, OrchestrationEvent,
    OrchestrationEventSink,
};
