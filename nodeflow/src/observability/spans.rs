//! Timing for units of work.

use std::time::Instant;
use tracing::{debug, warn};

/// Measures how long a unit of work took.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: &'static str,
}

impl SpanTimer {
    /// Starts timing `name`.
    #[must_use]
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Elapsed milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The span name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Logs the duration at debug level and returns it.
    pub fn finish(self) -> f64 {
        let duration_ms = self.elapsed_ms();
        debug!(span_name = self.name, duration_ms, "Handled");
        duration_ms
    }

    /// Logs a failed unit of work and returns its duration.
    pub fn fail(self, error: &dyn std::fmt::Display) -> f64 {
        let duration_ms = self.elapsed_ms();
        warn!(span_name = self.name, duration_ms, error = %error, "Handler failed");
        duration_ms
    }
}
