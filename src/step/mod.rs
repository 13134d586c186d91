//! Core step trait and fundamental step types.
//!
//! This module defines the [`Step`] trait, the unit of work every executor
//! and composite is built on, along with [`LambdaStep`] for closure-based
//! units and [`BoxedStepExt`] for fluent composition.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{ExecutionContext, Result};
use crate::streaming::OnceStream;

pub mod assign;
pub mod batch;
pub mod chain;
pub mod fallback;
pub mod parallel;
pub mod pipeline;
pub mod retry;

/// The fundamental trait for composable, async units of work.
///
/// Each step receives the ambient execution context and a typed input, and
/// produces a typed output or an error. Steps are immutable once built and
/// may be run concurrently from many call sites.
///
/// # Example
///
/// ```rust
/// use workunit::{Step, ExecutionContext, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let double = LambdaStep::new(|x: i32| async move {
///     Ok::<i32, workunit::Error>(x * 2)
/// });
/// let ctx = ExecutionContext::new();
/// assert_eq!(double.run(&ctx, 21).await.unwrap(), 42);
/// # });
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// The input type for this step.
    type Input: Send;
    /// The output type produced by this step.
    type Output: Send;

    /// Execute this step with the provided context and input.
    async fn run(&self, ctx: &ExecutionContext, input: Self::Input) -> Result<Self::Output>;

    /// Returns a human-readable name for this step. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returns `true` if `run` resolves promptly on its own once the context
    /// is cancelled.
    ///
    /// The invocation engine races every other step against cancellation and
    /// drops it mid-flight. Composites that run all their sub-units through
    /// the engine return `true`, so they get to finish and report what their
    /// sub-units completed.
    fn observes_cancellation(&self) -> bool {
        false
    }
}

/// An owned, type-erased step.
pub type BoxStep<I, O> = Box<dyn Step<Input = I, Output = O>>;

/// A shared, type-erased step. Composites holding one may be built from the
/// same sub-unit many times.
pub type SharedStep<I, O> = Arc<dyn Step<Input = I, Output = O>>;

/// A step constructed from a closure or function pointer.
///
/// The type parameters `I` and `O` encode the input and output types,
/// while `F` is the concrete closure type.
///
/// # Example
///
/// ```rust
/// use workunit::{LambdaStep, Step};
///
/// let step = LambdaStep::new(|x: i32| async move {
///     Ok::<i32, workunit::Error>(x * 2)
/// })
/// .with_name("double");
/// assert_eq!(step.name(), "double");
/// ```
pub struct LambdaStep<I, O, F> {
    /// The underlying closure.
    pub f: F,
    name: String,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> LambdaStep<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    /// Create a new `LambdaStep` from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: "lambda".to_string(),
            _phantom: PhantomData,
        }
    }

    /// Name this step. The name identifies it in failures and trace events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<F, I, O, Fut> Step for LambdaStep<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, _ctx: &ExecutionContext, input: I) -> Result<O> {
        (self.f)(input).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Extension trait providing fluent composition methods for all [`Step`] implementors.
///
/// Every method returns a new composite; the receiver is moved into it and
/// never mutated.
///
/// # Methods
///
/// - [`BoxedStepExt::then`]: Chain two steps sequentially
/// - [`BoxedStepExt::with_retry`]: Re-run on transient failure
/// - [`BoxedStepExt::with_fallbacks`]: Try alternates on failure
/// - [`BoxedStepExt::assign`]: Compute extra fields onto a record output
/// - [`BoxedStepExt::batched`]: Lift into a step over `Vec<Input>`
/// - [`BoxedStepExt::into_stream`]: Expose the output as a one-element stream
/// - [`BoxedStepExt::boxed`] / [`BoxedStepExt::shared`]: Erase the concrete type
pub trait BoxedStepExt: Step + Sized {
    /// Chain this step with another, feeding this step's output into `next`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use workunit::{LambdaStep, BoxedStepExt};
    ///
    /// let pipeline = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x + 1) })
    ///     .then(LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x * 3) }));
    /// ```
    fn then<S>(self, next: S) -> chain::ChainStep<Self, S>
    where
        S: Step<Input = Self::Output>,
        Self::Output: 'static,
    {
        chain::ChainStep::new(self, next)
    }

    /// Wrap this step in a retry policy.
    ///
    /// # Example
    ///
    /// ```rust
    /// use workunit::{LambdaStep, BoxedStepExt, RetryPolicy};
    ///
    /// let fetch = LambdaStep::new(|id: u32| async move { Ok::<u32, workunit::Error>(id) })
    ///     .with_retry(RetryPolicy::exponential(3));
    /// ```
    fn with_retry(self, policy: retry::RetryPolicy) -> retry::RetryStep<Self>
    where
        Self::Input: Clone,
    {
        retry::RetryStep::new(self, policy)
    }

    /// Wrap this step with alternates tried in order when it fails.
    fn with_fallbacks(
        self,
        alternates: Vec<BoxStep<Self::Input, Self::Output>>,
    ) -> fallback::FallbackStep<Self>
    where
        Self::Input: Clone + 'static,
        Self::Output: 'static,
    {
        fallback::FallbackStep::new(self).fallbacks(alternates)
    }

    /// Start a field-assignment composite over this step's record output.
    fn assign(self) -> assign::AssignBuilder<Self>
    where
        Self: Step<Output = assign::Record>,
    {
        assign::AssignStep::builder(self)
    }

    /// Lift this step into one over `Vec<Input>`, run through the batch executor.
    fn batched(self, config: batch::BatchConfig) -> batch::BatchStep<Self> {
        batch::BatchStep::new(self, config)
    }

    /// Expose this step's single output as a one-element stream.
    fn into_stream(self) -> OnceStream<Self> {
        OnceStream::new(self)
    }

    /// Erase the concrete step type, returning a trait object.
    fn boxed(self) -> BoxStep<Self::Input, Self::Output>
    where
        Self: 'static,
    {
        Box::new(self)
    }

    /// Erase the concrete step type behind an `Arc` so it can be shared.
    fn shared(self) -> SharedStep<Self::Input, Self::Output>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<T: Step + Sized> BoxedStepExt for T {}

#[async_trait]
impl<S> Step for Box<S>
where
    S: Step + ?Sized,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        (**self).run(ctx, input).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn observes_cancellation(&self) -> bool {
        (**self).observes_cancellation()
    }
}

#[async_trait]
impl<S> Step for Arc<S>
where
    S: Step + ?Sized,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        (**self).run(ctx, input).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn observes_cancellation(&self) -> bool {
        (**self).observes_cancellation()
    }
}
