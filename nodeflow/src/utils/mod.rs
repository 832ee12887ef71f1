//! Shared utilities: id generation, clocks and backoff policies.

mod backoff;
mod clock;
mod ids;

pub use backoff::{BackoffPolicy, BackoffState, BackoffStrategy, JitterStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{dedupe_key, derive_id, generate_id};
