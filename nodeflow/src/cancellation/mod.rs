//! Cooperative shutdown for engine workers.

mod task_group;
mod token;

pub use task_group::WorkerGroup;
pub use token::CancellationToken;
