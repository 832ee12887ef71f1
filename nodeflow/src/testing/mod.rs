//! Testing utilities for the node execution engine.
//!
//! This module provides:
//! - Mock steps (sync, failing, callback-driven)
//! - Plan fixtures and an engine harness on a manual clock
//! - Assertions over node statuses and transition histories

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_all_concluded, assert_node_status, assert_plan_status, assert_valid_transitions,
};
pub use fixtures::{
    chain, fixture_registry, fork_node, fork_plan, linear_plan, plan_of, section_node, step_node,
    TestEngine, FORK_STEP, SECTION_STEP,
};
pub use mocks::{callback_response, CallbackStep, FailingStep, MockStep};
