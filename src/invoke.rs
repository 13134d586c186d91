//! The invocation engine: run one unit against one input.
//!
//! [`invoke`] is the single entry point every executor and composite goes
//! through. It observes cancellation before the unit starts and while it
//! runs, and attributes unattributed failures to the unit that raised them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Error, ExecutionContext, Result, step::Step};

/// Run `step` once against `input`.
///
/// A missing context is replaced by a fresh one.
///
/// # Example
///
/// ```rust
/// use workunit::{invoke, LambdaStep, BoxedStepExt};
///
/// # tokio_test::block_on(async {
/// let add_three = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x + 3) });
/// let times_ten = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x * 10) });
/// let chain = add_three.then(times_ten);
///
/// assert_eq!(invoke(&chain, 4, None).await.unwrap(), 70);
/// # });
/// ```
pub async fn invoke<S>(
    step: &S,
    input: S::Input,
    ctx: Option<&ExecutionContext>,
) -> Result<S::Output>
where
    S: Step + ?Sized,
{
    match ctx {
        Some(ctx) => run_observed(step, ctx, input).await,
        None => run_observed(step, &ExecutionContext::new(), input).await,
    }
}

/// Run a sub-unit on behalf of a composite.
pub(crate) async fn run_observed<S>(
    step: &S,
    ctx: &ExecutionContext,
    input: S::Input,
) -> Result<S::Output>
where
    S: Step + ?Sized,
{
    if ctx.is_cancelled() {
        ctx.record_cancellation();
        return Err(Error::cancelled(step.name()));
    }

    if step.observes_cancellation() {
        return step.run(ctx, input).await.map_err(|e| e.attribute(step.name()));
    }

    tokio::select! {
        biased;
        () = ctx.cancelled() => {
            ctx.record_cancellation();
            Err(Error::cancelled(step.name()))
        }
        result = step.run(ctx, input) => result.map_err(|e| e.attribute(step.name())),
    }
}

/// Start `step` on the tokio runtime and return immediately.
///
/// The invocation runs under a child of `ctx`, so [`InvocationHandle::cancel`]
/// stops this invocation without cancelling the caller's context.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use workunit::{spawn, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let square = LambdaStep::new(|x: i64| async move { Ok::<i64, workunit::Error>(x * x) });
/// let square = Arc::new(square);
/// let handle = spawn(square, 12, None);
/// assert_eq!(handle.join().await.unwrap(), 144);
/// # });
/// ```
pub fn spawn<S>(
    step: Arc<S>,
    input: S::Input,
    ctx: Option<ExecutionContext>,
) -> InvocationHandle<S::Output>
where
    S: Step + ?Sized + 'static,
    S::Input: 'static,
    S::Output: 'static,
{
    let ctx = ctx.unwrap_or_default().child();
    let token = ctx.cancellation_token();
    let unit = step.name().to_string();
    let join = tokio::spawn(async move { run_observed(step.as_ref(), &ctx, input).await });
    InvocationHandle { join, token, unit }
}

/// Handle to an invocation started with [`spawn`].
#[derive(Debug)]
pub struct InvocationHandle<O> {
    join: JoinHandle<Result<O>>,
    token: CancellationToken,
    unit: String,
}

impl<O> InvocationHandle<O> {
    /// Request cancellation; the unit observes it at its next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the invocation has resolved.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the invocation to resolve.
    pub async fn join(self) -> Result<O> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::cancelled(self.unit)),
            Err(e) => Err(Error::execution(self.unit, format!("task panicked: {e}"))),
        }
    }
}
