//! Structured execution events for tracing and observability.
//!
//! Composites record these on the [`ExecutionContext`](crate::ExecutionContext)
//! as they run, so a caller can reconstruct what happened inside an
//! invocation (which stage ran, which attempt failed, which alternate won)
//! without parsing log output.

use serde::{Serialize, Deserialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Events that can be emitted while a unit of work executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkflowEvent {
    /// A unit has started execution.
    StepStart {
        /// Name of the unit being executed.
        step_name: String,
        /// The Rust type name of the input.
        input_type: String,
        /// Context tags at the time the unit started.
        tags: Vec<String>,
    },
    /// A unit has finished successfully.
    StepEnd {
        /// Name of the unit that completed.
        step_name: String,
        /// Duration of execution in milliseconds.
        duration_ms: u128,
    },
    /// A unit failed.
    Error {
        /// Name of the unit where the error occurred.
        step_name: String,
        /// Error message describing what went wrong.
        message: String,
    },
    /// A unit observed cancellation and stopped.
    Cancelled {
        /// Name of the unit that was cancelled.
        step_name: String,
    },
    /// A retry policy scheduled another attempt.
    Retry {
        /// Name of the retried unit.
        step_name: String,
        /// The attempt that just failed (1-based).
        attempt: usize,
        /// Backoff before the next attempt, in milliseconds.
        delay_ms: u128,
        /// The failure that triggered the retry.
        message: String,
    },
    /// A fallback chain moved on to an alternate.
    Fallback {
        /// Name of the fallback composite.
        step_name: String,
        /// Name of the alternate about to run.
        alternate: String,
        /// Zero-based position of the alternate.
        index: usize,
    },
}

/// A timestamped trace entry containing a workflow event.
///
/// Each trace entry records when the event occurred (as Unix epoch milliseconds)
/// along with the event itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The workflow event that was recorded.
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: WorkflowEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}
