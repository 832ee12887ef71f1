//! Core domain model for the node execution engine.
//!
//! - Statuses and the transition graph
//! - Ambiance and levels
//! - Plans and plan nodes
//! - Step responses and executables
//! - Node and plan execution records

mod ambiance;
mod node_execution;
mod plan;
mod status;
mod step;

pub use ambiance::{Ambiance, Level};
pub use node_execution::{NodeExecution, PlanExecution};
pub use plan::{NodeGroup, Plan, PlanNode, SkipCondition};
pub use status::{worst_status, Status};
pub use step::{
    AsyncExecutableResponse, ChildOutcome, ChildrenExecutableResponse, Executable, ExecutionMode,
    FailureInfo, FailureType, ResponseData, StepResponse,
};
