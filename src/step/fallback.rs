//! Ordered alternates for a failing unit.

use async_trait::async_trait;
use tracing::warn;

use crate::{Error, ExecutionContext, Result, WorkflowEvent};
use crate::invoke::run_observed;
use super::{BoxStep, Step};

/// Tries a primary step, then each alternate in order, until one succeeds.
///
/// If every attempt fails the result is [`Error::AllFallbacksFailed`] with
/// all failures, primary first. Cancellation is never treated as a failure
/// to recover from: it ends the chain immediately.
///
/// # Example
///
/// ```rust
/// use workunit::{invoke, BoxedStepExt, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let primary = LambdaStep::new(|_: String| async move {
///     Err::<String, _>(workunit::Error::from("primary region down"))
/// });
/// let backup = LambdaStep::new(|q: String| async move {
///     Ok::<String, workunit::Error>(format!("backup:{q}"))
/// });
///
/// let resilient = primary.with_fallbacks(vec![backup.boxed()]);
/// assert_eq!(invoke(&resilient, "q".to_string(), None).await.unwrap(), "backup:q");
/// # });
/// ```
pub struct FallbackStep<S: Step> {
    primary: S,
    alternates: Vec<BoxStep<S::Input, S::Output>>,
    name: String,
}

impl<S> FallbackStep<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    /// Start with `primary` and no alternates.
    pub fn new(primary: S) -> Self {
        let name = format!("fallback({})", primary.name());
        Self {
            primary,
            alternates: Vec::new(),
            name,
        }
    }

    /// Append an alternate, tried after everything added before it.
    #[must_use]
    pub fn fallback<A>(mut self, alternate: A) -> Self
    where
        A: Step<Input = S::Input, Output = S::Output> + 'static,
    {
        self.alternates.push(Box::new(alternate));
        self
    }

    /// Append several already boxed alternates.
    #[must_use]
    pub fn fallbacks(
        mut self,
        alternates: impl IntoIterator<Item = BoxStep<S::Input, S::Output>>,
    ) -> Self {
        self.alternates.extend(alternates);
        self
    }

    /// Number of alternates.
    #[must_use]
    pub fn alternate_count(&self) -> usize {
        self.alternates.len()
    }
}

#[async_trait]
impl<S> Step for FallbackStep<S>
where
    S: Step,
    S::Input: Clone + 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        let mut failures = Vec::with_capacity(self.alternates.len() + 1);
        match run_observed(&self.primary, ctx, input.clone()).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => failures.push(e),
        }

        for (index, alternate) in self.alternates.iter().enumerate() {
            warn!(
                unit = %self.name,
                alternate = alternate.name(),
                index,
                error = %failures[failures.len() - 1],
                "falling back"
            );
            ctx.record_fallback();
            ctx.emit(WorkflowEvent::Fallback {
                step_name: self.name.clone(),
                alternate: alternate.name().to_string(),
                index,
            });
            match run_observed(alternate.as_ref(), ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => failures.push(e),
            }
        }

        Err(Error::AllFallbacksFailed {
            unit: self.name.clone(),
            failures,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_cancellation(&self) -> bool {
        true
    }
}
