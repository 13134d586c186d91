//! Metrics collection for work unit execution.
//!
//! This module provides `WorkflowMetrics` for tracking completed units,
//! recovery activity (retries, fallbacks), cancellations and failures.

use serde::{Serialize, Deserialize};

/// Aggregated metrics for one or more runs sharing an execution context.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Number of units completed successfully.
    pub steps_completed: usize,
    /// Number of re-invocations performed by retry policies.
    pub retries: usize,
    /// Number of alternates invoked by fallback chains.
    pub fallbacks: usize,
    /// Number of cancellations observed.
    pub cancellations: usize,
    /// Collected failure messages.
    pub failures: Vec<String>,
}

impl WorkflowMetrics {
    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Increment the steps completed counter.
    pub fn record_step(&mut self) {
        self.steps_completed += 1;
    }

    /// Increment the retry counter.
    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Increment the fallback counter.
    pub fn record_fallback(&mut self) {
        self.fallbacks += 1;
    }

    /// Increment the cancellation counter.
    pub fn record_cancellation(&mut self) {
        self.cancellations += 1;
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
