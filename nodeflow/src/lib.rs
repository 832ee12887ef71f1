//! # Nodeflow
//!
//! A durable node execution engine for CI/CD pipelines.
//!
//! A plan is a tree of nodes (pipeline, stages, step groups, steps). Nodeflow
//! drives every node execution through its lifecycle with support for:
//!
//! - **Durable state**: node and plan executions are persisted records updated
//!   by compare-and-swap, so any worker can pick up any unit of work
//! - **Async steps**: waits keyed by callback id, with out-of-order and
//!   duplicate notifications handled
//! - **Advisers**: retry, next-step, ignore-failure, rollback and end-plan
//!   decisions made after a node concludes
//! - **Interrupts**: abort, pause, resume, retry and mark operations on a node
//!   or a whole plan
//! - **Resource restraint**: FIFO-fair ticket locks scoped to a stage or plan
//! - **Timeouts**: persisted deadlines that pause and resume with their node
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nodeflow::prelude::*;
//!
//! let engine = Engine::builder()
//!     .with_registry(Registry::new().with_step(Arc::new(ShellStep::new())))
//!     .build();
//!
//! let plan = Plan::new("build-and-test", "build")
//!     .with_node(PlanNode::new("build", "Shell").with_adviser(AdviserObtainment::next_step("test")))
//!     .with_node(PlanNode::new("test", "Shell"));
//!
//! let plan_execution_id = engine.start_plan(plan, Ambiance::new(generate_id(), "build-and-test")).await?;
//! let workers = engine.spawn_workers();
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod advise;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod facilitator;
pub mod interrupts;
pub mod observability;
pub mod registry;
pub mod restraint;
pub mod rollback;
pub mod steps;
pub mod store;
pub mod testing;
pub mod timeout;
pub mod utils;
pub mod waiter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::advise::{Advise, Adviser, AdviserObtainment, RetryAdviserParameters};
    pub use crate::cancellation::{CancellationToken, WorkerGroup};
    pub use crate::config::{ConsumerConfig, EngineConfig};
    pub use crate::core::{
        Ambiance, AsyncExecutableResponse, ChildrenExecutableResponse, Executable, ExecutionMode,
        FailureType, Level, NodeExecution, NodeGroup, Plan, PlanExecution, PlanNode, Status,
        StepResponse,
    };
    pub use crate::engine::{Engine, EngineBuilder, EnginePersistence};
    pub use crate::errors::{EngineError, Result, StepError};
    pub use crate::events::{LoggingEventSink, NoOpEventSink, OrchestrationEventSink};
    pub use crate::facilitator::{FacilitatorResponse, FacilitatorType};
    pub use crate::interrupts::{InterruptRequest, InterruptType};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::registry::Registry;
    pub use crate::steps::{Step, StepContext};
    pub use crate::utils::{generate_id, Clock, SystemClock};
    pub use crate::waiter::NotifyOutcome;
}
