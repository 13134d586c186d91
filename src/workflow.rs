//! High-level workflow container with automatic metrics collection.

use tracing::debug;

use crate::{ExecutionContext, Result, StepStream, StreamStep, WorkflowMetrics, step::Step};
use crate::step::batch::{self, BatchConfig};

/// A named top-level unit that owns its step and a fresh context per run.
///
/// `Workflow` is the usual entry point for application code: each call to
/// [`Workflow::run`] creates a new [`ExecutionContext`] tagged with the
/// workflow's name (`workflow` metadata), invokes the step through the
/// invocation engine, and returns both the result and the accumulated
/// [`WorkflowMetrics`].
///
/// # Example
///
/// ```rust
/// use workunit::{LambdaStep, Workflow, BoxedStepExt};
///
/// # tokio_test::block_on(async {
/// let step_a = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x * 2) });
/// let step_b = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x + 10) });
/// let workflow = Workflow::new(step_a.then(step_b)).with_name("DoubleAndAdd");
///
/// let (result, metrics) = workflow.run(5).await.unwrap();
/// assert_eq!(result, 20);
/// assert_eq!(metrics.steps_completed, 1);
/// # });
/// ```
pub struct Workflow<S> {
    step: S,
    name: String,
}

impl<S: Step> Workflow<S> {
    /// Create a new workflow wrapping the given step.
    pub fn new(step: S) -> Self {
        Self {
            step,
            name: "workflow".to_string(),
        }
    }

    /// Set a human-readable name for this workflow.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the name of this workflow.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext::new().with_metadata("workflow", self.name.as_str())
    }

    /// Run the workflow, returning the result along with the collected metrics.
    ///
    /// A fresh [`ExecutionContext`] is created for each invocation.
    pub async fn run(&self, input: S::Input) -> Result<(S::Output, WorkflowMetrics)> {
        let ctx = self.context();
        debug!(workflow = %self.name, unit = self.step.name(), "running workflow");
        let output = self.run_with_ctx(&ctx, input).await?;
        Ok((output, ctx.snapshot()))
    }

    /// Run the workflow with a caller-provided execution context.
    ///
    /// Useful to share cancellation, tags or accumulated metrics across runs.
    /// The outcome is recorded on `ctx` as one completed step or one failure,
    /// unless the step recorded its own (an [`InstrumentedStep`] does).
    ///
    /// [`InstrumentedStep`]: crate::InstrumentedStep
    pub async fn run_with_ctx(
        &self,
        ctx: &ExecutionContext,
        input: S::Input,
    ) -> Result<S::Output> {
        let scope = ctx.scope();
        let result = crate::invoke(&self.step, input, Some(&scope)).await;
        if !scope.outcome_recorded() {
            match &result {
                Ok(_) => ctx.record_step(),
                Err(e) if e.is_cancelled() => {}
                Err(e) => ctx.record_failure(e.to_string()),
            }
        }
        result
    }

    /// Run the workflow over many inputs, returning per-input results in
    /// input order together with the metrics of the whole batch.
    pub async fn batch(
        &self,
        inputs: Vec<S::Input>,
        config: BatchConfig,
    ) -> (Vec<Result<S::Output>>, WorkflowMetrics) {
        let ctx = self.context();
        let results = batch::batch(&self.step, inputs, Some(&ctx), config).await;
        for result in &results {
            match result {
                Ok(_) => ctx.record_step(),
                Err(e) if e.is_cancelled() => {}
                Err(e) => ctx.record_failure(e.to_string()),
            }
        }
        (results, ctx.snapshot())
    }

    /// Stream the workflow's output under a fresh context.
    pub fn stream<'a>(&'a self, input: S::Input) -> StepStream<'a, S::Item>
    where
        S: StreamStep,
        S::Item: 'a,
    {
        let ctx = self.context();
        crate::stream(&self.step, input, Some(&ctx))
    }

    /// Access the inner step.
    pub fn inner(&self) -> &S {
        &self.step
    }

    /// Consume the workflow, returning the inner step.
    pub fn into_inner(self) -> S {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxedStepExt, Error, InstrumentedStep, LambdaStep, LambdaStreamStep, RetryPolicy};
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_collects_retry_metrics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let flaky = LambdaStep::new(move |x: i32| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::from("cold start"))
                } else {
                    Ok(x)
                }
            }
        });
        let workflow = Workflow::new(flaky.with_retry(RetryPolicy::new(3))).with_name("warmup");

        let (out, metrics) = workflow.run(8).await.unwrap();
        assert_eq!(out, 8);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.steps_completed, 1);
    }

    #[tokio::test]
    async fn test_context_names_the_workflow() {
        struct WhoAmI;

        #[async_trait::async_trait]
        impl Step for WhoAmI {
            type Input = ();
            type Output = String;

            async fn run(&self, ctx: &ExecutionContext, _input: ()) -> Result<String> {
                Ok(ctx
                    .metadata_value("workflow")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string())
            }
        }

        let (name, _) = Workflow::new(WhoAmI).with_name("nightly").run(()).await.unwrap();
        assert_eq!(name, "nightly");
    }

    #[tokio::test]
    async fn test_shared_context_accumulates() {
        let workflow = Workflow::new(LambdaStep::new(|x: u8| async move {
            if x == 0 {
                Err(Error::from("zero"))
            } else {
                Ok(x)
            }
        }));
        let ctx = ExecutionContext::new();
        workflow.run_with_ctx(&ctx, 1).await.unwrap();
        workflow.run_with_ctx(&ctx, 2).await.unwrap();
        assert!(workflow.run_with_ctx(&ctx, 0).await.is_err());

        let metrics = ctx.snapshot();
        assert_eq!(metrics.steps_completed, 2);
        assert_eq!(metrics.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_instrumented_outcome_counted_once() {
        let checked = InstrumentedStep::new(
            LambdaStep::new(|x: i32| async move {
                if x < 0 {
                    Err(Error::from("negative"))
                } else {
                    Ok(x)
                }
            }),
            "check",
        );
        let workflow = Workflow::new(checked);

        let (_, metrics) = workflow.run(3).await.unwrap();
        assert_eq!(metrics.steps_completed, 1);

        let ctx = ExecutionContext::new();
        assert!(workflow.run_with_ctx(&ctx, -3).await.is_err());
        let metrics = ctx.snapshot();
        assert_eq!(metrics.failures.len(), 1);
        assert_eq!(metrics.steps_completed, 0);
    }

    #[tokio::test]
    async fn test_batch_reports_each_input() {
        let workflow = Workflow::new(LambdaStep::new(|x: i32| async move {
            if x < 0 {
                Err(Error::from("negative"))
            } else {
                Ok(x * x)
            }
        }));
        let (results, metrics) = workflow.batch(vec![1, -2, 3], BatchConfig::concurrent(2)).await;

        assert_eq!(results[0].as_ref().ok(), Some(&1));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().ok(), Some(&9));
        assert_eq!(metrics.steps_completed, 2);
        assert_eq!(metrics.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_through_workflow() {
        let words = LambdaStreamStep::new(|text: String| {
            let items: Vec<_> = text
                .split_whitespace()
                .map(|w| Ok::<String, Error>(w.to_string()))
                .collect();
            futures::stream::iter(items)
        });
        let workflow = Workflow::new(words);
        let out: Vec<String> = workflow.stream("a b c".to_string()).try_collect().await.unwrap();
        assert_eq!(out, vec!["a", "b", "c"]);
    }
}
