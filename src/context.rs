//! Execution context for work unit invocations.
//!
//! This module provides the `ExecutionContext` which accompanies every
//! invocation, carrying tags, metadata, a cancellation signal and the shared
//! metrics/trace accumulators. Contexts have value semantics: the `with_*`
//! methods return an augmented copy, and nothing can be removed once set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::WorkflowMetrics;
use crate::events::{TraceEntry, WorkflowEvent};

/// Context passed to every unit of work.
///
/// Cloning is cheap; clones share the cancellation token, metrics and trace
/// log. Use [`ExecutionContext::child`] to derive a context whose cancellation
/// can be triggered without affecting the parent.
///
/// # Example
///
/// ```rust
/// use workunit::ExecutionContext;
/// use std::time::Duration;
///
/// let ctx = ExecutionContext::new()
///     .with_tag("nightly")
///     .with_metadata("tenant", "acme")
///     .with_timeout(Duration::from_secs(30));
///
/// let nested = ctx.child().with_tag("retry");
/// assert!(nested.has_tag("nightly"));
/// assert!(nested.has_tag("retry"));
/// assert!(!ctx.has_tag("retry"));
///
/// nested.cancel();
/// assert!(nested.is_cancelled());
/// assert!(!ctx.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Shared metrics accumulator.
    pub metrics: Arc<Mutex<WorkflowMetrics>>,
    /// Shared trace log for structured workflow events.
    pub traces: Arc<Mutex<Vec<TraceEntry>>>,
    tags: BTreeSet<String>,
    metadata: BTreeMap<String, Value>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    max_concurrency: Option<usize>,
    // Set by the first step or failure recorded through this context or
    // anything derived from it.
    outcome_recorded: Arc<AtomicBool>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExecutionContext {
    /// Create a new context with no tags, no metadata and a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(WorkflowMetrics::default())),
            traces: Arc::new(Mutex::new(Vec::new())),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            cancellation: CancellationToken::new(),
            deadline: None,
            max_concurrency: None,
            outcome_recorded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive a nested context.
    ///
    /// The child inherits tags, metadata, deadline and the shared
    /// accumulators. Its cancellation token is a child of this one: cancelling
    /// the parent cancels the child, never the other way round.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    /// A child context that tracks on its own whether an outcome was
    /// recorded underneath it.
    pub(crate) fn scope(&self) -> Self {
        Self {
            outcome_recorded: Arc::new(AtomicBool::new(false)),
            ..self.child()
        }
    }

    /// Returns `true` if a completed step or a failure was recorded through
    /// this context or a context derived from it since its scope began.
    pub(crate) fn outcome_recorded(&self) -> bool {
        self.outcome_recorded.load(Ordering::SeqCst)
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags.
    #[must_use]
    pub fn with_tags<T: Into<String>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set a metadata entry, overriding any inherited value under `key`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a deadline. An earlier inherited deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set the concurrency budget shared by batch and fan-out executors that
    /// do not configure their own limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Tags visible to this context, sorted.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Returns `true` if `tag` is present.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// All metadata entries.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Look up a single metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The effective deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The shared concurrency budget, if one was set.
    #[must_use]
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Signal cancellation to this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Returns `true` once cancellation was signalled or the deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves once cancellation is signalled or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancellation.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancellation.cancelled().await,
        }
    }

    /// A clone of the underlying cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Increment the steps completed counter.
    pub fn record_step(&self) {
        self.outcome_recorded.store(true, Ordering::SeqCst);
        lock(&self.metrics).record_step();
    }

    /// Record a failure message.
    pub fn record_failure(&self, error: impl Into<String>) {
        self.outcome_recorded.store(true, Ordering::SeqCst);
        lock(&self.metrics).record_failure(error.into());
    }

    /// Increment the retry counter.
    pub fn record_retry(&self) {
        lock(&self.metrics).record_retry();
    }

    /// Increment the fallback counter.
    pub fn record_fallback(&self) {
        lock(&self.metrics).record_fallback();
    }

    /// Increment the cancellation counter.
    pub fn record_cancellation(&self) {
        lock(&self.metrics).record_cancellation();
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowMetrics {
        lock(&self.metrics).clone()
    }

    /// Emit a structured workflow event to the trace log.
    ///
    /// Events are timestamped automatically when emitted.
    pub fn emit(&self, event: WorkflowEvent) {
        let entry = TraceEntry::new(event);
        lock(&self.traces).push(entry);
    }

    /// Get a snapshot of the current trace log.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        lock(&self.traces).clone()
    }

    /// Clear all trace entries.
    ///
    /// This can be useful when reusing a context across multiple runs.
    pub fn clear_traces(&self) {
        lock(&self.traces).clear();
    }
}
