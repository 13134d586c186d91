//! Sequential step composition.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::future;

use crate::{ExecutionContext, Result};
use crate::invoke::run_observed;
use crate::streaming::{StepStream, StreamStep};
use super::Step;

/// Two steps composed sequentially: the output of `A` feeds into `B`.
///
/// The first failing stage short-circuits the chain, and cancellation is
/// observed before each stage starts. Longer chains nest (`a.then(b).then(c)`
/// and `a.then(b.then(c))` behave identically).
///
/// When `B` is a [`StreamStep`] the chain is one too: `A` runs to completion
/// once, then `B`'s elements are yielded as they arrive.
///
/// Constructed via [`BoxedStepExt::then`](crate::BoxedStepExt::then).
pub struct ChainStep<A, B> {
    first: A,
    second: B,
    name: String,
}

impl<A: Step, B: Step> ChainStep<A, B> {
    /// Create a new chained step.
    pub fn new(first: A, second: B) -> Self {
        let name = format!("{} | {}", first.name(), second.name());
        Self {
            first,
            second,
            name,
        }
    }
}

#[async_trait]
impl<A, B> Step for ChainStep<A, B>
where
    A: Step,
    B: Step<Input = A::Output>,
    A::Input: 'static,
    A::Output: 'static,
    B::Output: 'static,
{
    type Input = A::Input;
    type Output = B::Output;

    async fn run(&self, ctx: &ExecutionContext, input: A::Input) -> Result<B::Output> {
        let intermediate = run_observed(&self.first, ctx, input).await?;
        run_observed(&self.second, ctx, intermediate).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_cancellation(&self) -> bool {
        true
    }
}

impl<A, B> StreamStep for ChainStep<A, B>
where
    A: Step,
    B: StreamStep<Input = A::Output>,
    A::Input: 'static,
    A::Output: 'static,
    B::Output: 'static,
    B::Item: 'static,
{
    type Item = B::Item;

    fn stream<'a>(&'a self, ctx: &ExecutionContext, input: A::Input) -> StepStream<'a, B::Item> {
        let ctx = ctx.clone();
        stream::once(async move {
            match run_observed(&self.first, &ctx, input).await {
                Ok(intermediate) => self.second.stream(&ctx, intermediate),
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            }
        })
        .flatten()
        .boxed()
    }
}
