//! # workunit
//!
//! Type-safe, composable async units of work.
//!
//! Every piece of work is a [`Step`]: an immutable value that maps a typed
//! input to a typed output under an [`ExecutionContext`]. Steps are run
//! through one of three executors ([`invoke`], [`batch`] and [`stream`]) and
//! combined into larger steps that are themselves steps, so composites nest
//! freely.
//!
//! ## Core Concepts
//!
//! - **Step**: The fundamental trait for units of work
//! - **ExecutionContext**: Tags, metadata, cancellation and deadline shared by an invocation
//! - **invoke / spawn / batch / stream**: The executors
//! - **ChainStep** and **Pipeline**: Sequential composition, type-checked when built
//! - **ParallelStep**: Named concurrent branches over one input
//! - **AssignStep**: Computed fields merged into a record
//! - **RetryStep**: Bounded re-execution with backoff
//! - **FallbackStep**: Ordered alternates on failure
//! - **InstrumentedStep**: Trace events around any step
//! - **Workflow**: High-level container with automatic metrics collection
//!
//! ## Example: Fluent Pipeline with Metrics
//!
//! ```rust
//! use workunit::{BoxedStepExt, LambdaStep, RetryPolicy, Workflow};
//!
//! # tokio_test::block_on(async {
//! let step_a = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x * 2) });
//! let step_b = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x + 10) });
//!
//! let pipeline = step_a.then(step_b).with_retry(RetryPolicy::new(3));
//!
//! let workflow = Workflow::new(pipeline).with_name("DoubleAndAdd");
//! let (result, metrics) = workflow.run(5).await.unwrap();
//!
//! assert_eq!(result, 20);
//! assert_eq!(metrics.steps_completed, 1);
//! assert_eq!(metrics.retries, 0);
//! # });
//! ```

pub mod error;
pub mod context;
pub mod metrics;
pub mod events;
pub mod invoke;
pub mod streaming;
pub mod step;
pub mod instrumented;
pub mod workflow;

pub use error::{Error, FailureKind, Result};
pub use context::ExecutionContext;
pub use metrics::WorkflowMetrics;
pub use events::{TraceEntry, WorkflowEvent};
pub use invoke::{invoke, spawn, InvocationHandle};
pub use streaming::{stream, LambdaStreamStep, OnceStream, StepStream, StreamStep};
pub use instrumented::InstrumentedStep;
pub use workflow::Workflow;

// Re-export step types
pub use step::{BoxStep, BoxedStepExt, LambdaStep, SharedStep, Step};
pub use step::assign::{AssignBuilder, AssignStep, Passthrough, Record};
pub use step::batch::{batch, try_batch, BatchConfig, BatchStep};
pub use step::chain::ChainStep;
pub use step::fallback::FallbackStep;
pub use step::parallel::{BranchMap, ParallelBuilder, ParallelStep, PartialResults};
pub use step::pipeline::{Pipeline, PipelineBuilder};
pub use step::retry::{Backoff, RetryConfig, RetryPolicy, RetryStep};
