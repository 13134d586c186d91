//! Batch execution: one unit over an ordered sequence of inputs.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, ExecutionContext, Result};
use crate::invoke::run_observed;
use super::Step;

/// Settings for [`batch`].
///
/// # Example
///
/// ```rust
/// use workunit::BatchConfig;
///
/// let config: BatchConfig = serde_json::from_str(r#"{"max_concurrency": 8}"#).unwrap();
/// assert_eq!(config, BatchConfig::concurrent(8));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of elements in flight. `None` defers to the context's
    /// shared budget, and runs sequentially if there is none.
    pub max_concurrency: Option<usize>,
    /// Stop at the first failure, cancelling everything still in flight.
    pub fail_fast: bool,
}

impl BatchConfig {
    /// Sequential, collect-every-result batching.
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            max_concurrency: Some(1),
            fail_fast: false,
        }
    }

    /// Up to `limit` elements in flight.
    #[must_use]
    pub fn concurrent(limit: usize) -> Self {
        Self {
            max_concurrency: Some(limit),
            fail_fast: false,
        }
    }

    /// Enable fail-fast mode.
    #[must_use]
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    fn limit(&self, ctx: &ExecutionContext) -> usize {
        self.max_concurrency
            .or(ctx.max_concurrency())
            .unwrap_or(1)
            .max(1)
    }
}

/// Apply `step` to every input, returning one result per input in input order.
///
/// Elements run concurrently up to the configured limit and may complete in
/// any order; result `i` always belongs to input `i`. A failing element does
/// not stop the others unless [`BatchConfig::fail_fast`] is set, in which case
/// the first failure cancels everything still running and every unfinished
/// position reports `Cancelled`.
///
/// # Example
///
/// ```rust
/// use workunit::{batch, BatchConfig, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let square = LambdaStep::new(|x: i32| async move { Ok::<i32, workunit::Error>(x * x) });
/// let results = batch(&square, vec![1, 2, 3, 4, 5], None, BatchConfig::concurrent(4)).await;
/// let values: Vec<i32> = results.into_iter().map(Result::unwrap).collect();
/// assert_eq!(values, vec![1, 4, 9, 16, 25]);
/// # });
/// ```
pub async fn batch<S>(
    step: &S,
    inputs: Vec<S::Input>,
    ctx: Option<&ExecutionContext>,
    config: BatchConfig,
) -> Vec<Result<S::Output>>
where
    S: Step + ?Sized,
{
    let ctx = ctx.map_or_else(ExecutionContext::new, ExecutionContext::child);
    let limit = config.limit(&ctx);
    let total = inputs.len();
    debug!(unit = step.name(), total, limit, fail_fast = config.fail_fast, "starting batch");

    let mut slots: Vec<Option<Result<S::Output>>> = (0..total).map(|_| None).collect();
    {
        let ctx = &ctx;
        let mut pending = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| async move { (index, run_observed(step, ctx, input).await) })
            .buffer_unordered(limit);

        while let Some((index, result)) = pending.next().await {
            let failed = result.is_err();
            slots[index] = Some(result);
            if failed && config.fail_fast {
                debug!(unit = step.name(), index, "batch element failed, cancelling the rest");
                ctx.cancel();
                break;
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(Error::cancelled(step.name()))))
        .collect()
}

/// Fail-fast batch: all outputs in input order, or the first failure.
///
/// "First" means first to complete; with concurrency above one that need not
/// be the lowest failing index.
pub async fn try_batch<S>(
    step: &S,
    inputs: Vec<S::Input>,
    ctx: Option<&ExecutionContext>,
    config: BatchConfig,
) -> Result<Vec<S::Output>>
where
    S: Step + ?Sized,
{
    let results = batch(step, inputs, ctx, config.fail_fast()).await;
    let mut outputs = Vec::with_capacity(results.len());
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) if e.is_cancelled() => {
                cancelled.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    match cancelled {
        Some(e) => Err(e),
        None => Ok(outputs),
    }
}

/// A step over `Vec<Input>` that runs its inner step through [`try_batch`].
///
/// Constructed via [`BoxedStepExt::batched`](crate::BoxedStepExt::batched).
pub struct BatchStep<S> {
    step: S,
    config: BatchConfig,
    name: String,
}

impl<S: Step> BatchStep<S> {
    /// Wrap `step` for batch use. The wrapper is named `batch(<inner>)`.
    pub fn new(step: S, config: BatchConfig) -> Self {
        let name = format!("batch({})", step.name());
        Self { step, config, name }
    }
}

#[async_trait]
impl<S> Step for BatchStep<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = Vec<S::Input>;
    type Output = Vec<S::Output>;

    async fn run(
        &self,
        ctx: &ExecutionContext,
        input: Vec<S::Input>,
    ) -> Result<Vec<S::Output>> {
        try_batch(&self.step, input, Some(ctx), self.config).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_cancellation(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxedStepExt, LambdaStep, invoke};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_square_preserves_order_under_concurrency() {
        // Later inputs finish first.
        let square = LambdaStep::new(|x: u64| async move {
            tokio::time::sleep(Duration::from_millis(50 / x)).await;
            Ok::<u64, Error>(x * x)
        });
        let results = batch(&square, vec![1, 2, 3, 4, 5], None, BatchConfig::concurrent(4)).await;
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![1, 4, 9, 16, 25]);
    }

    #[tokio::test]
    async fn test_batch_matches_invoke_for_every_index() {
        let describe = LambdaStep::new(|x: i32| async move {
            if x % 3 == 0 {
                Err(Error::from(format!("{x} is divisible by three")))
            } else {
                Ok(format!("#{x}"))
            }
        });
        let inputs: Vec<i32> = (0..10).collect();
        let configs = [
            BatchConfig::sequential(),
            BatchConfig::concurrent(3),
            BatchConfig::concurrent(64),
        ];
        for config in configs {
            let results = batch(&describe, inputs.clone(), None, config).await;
            assert_eq!(results.len(), inputs.len());
            for (x, result) in inputs.iter().zip(results) {
                let expected = invoke(&describe, *x, None).await;
                match (result, expected) {
                    (Ok(a), Ok(b)) => assert_eq!(a, b),
                    (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
                    _ => panic!("batch and invoke disagree at {x}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (flight, high) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let step = LambdaStep::new(move |x: i32| {
            let (flight, high) = (Arc::clone(&flight), Arc::clone(&high));
            async move {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                high.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<i32, Error>(x)
            }
        });

        let ctx = ExecutionContext::new().with_max_concurrency(2);
        let results = batch(&step, (0..8).collect(), Some(&ctx), BatchConfig::default()).await;
        assert!(results.iter().all(Result::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_remaining() {
        let step = LambdaStep::new(|x: i32| async move {
            if x == 1 {
                Err(Error::from("bad record"))
            } else {
                Ok(x)
            }
        })
        .with_name("load");
        let config = BatchConfig::sequential().fail_fast();
        let results = batch(&step, vec![0, 1, 2, 3], None, config).await;

        assert_eq!(results.len(), 4);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(matches!(results[1], Err(Error::Execution { .. })));
        assert!(results[2].as_ref().unwrap_err().is_cancelled());
        assert!(results[3].as_ref().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_cancels_in_flight_elements() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        let step = LambdaStep::new(move |x: i32| {
            let done = Arc::clone(&done);
            async move {
                if x == 1 {
                    return Err(Error::from("bad record"));
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            }
        })
        .with_name("load");

        let started = tokio::time::Instant::now();
        let config = BatchConfig::concurrent(4).fail_fast();
        let results = batch(&step, vec![0, 1, 2, 3], None, config).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(matches!(results[1], Err(Error::Execution { .. })));
        for index in [0, 2, 3] {
            assert!(results[index].as_ref().unwrap_err().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_fail_fast_does_not_cancel_caller() {
        let step = LambdaStep::new(|_: i32| async move { Err::<i32, _>(Error::from("nope")) });
        let ctx = ExecutionContext::new();
        let err = try_batch(&step, vec![1, 2], Some(&ctx), BatchConfig::default())
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_collect_mode_keeps_going() {
        let step = LambdaStep::new(|x: i32| async move {
            if x < 0 { Err(Error::from("negative")) } else { Ok(x) }
        });
        let results = batch(&step, vec![-1, 2, -3, 4], None, BatchConfig::concurrent(2)).await;
        let ok: Vec<bool> = results.iter().map(Result::is_ok).collect();
        assert_eq!(ok, vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_batched_step_composes() {
        let double = LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x * 2) })
            .batched(BatchConfig::concurrent(2));
        let out = invoke(&double, vec![1, 2, 3], None).await.unwrap();
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[test]
    fn test_batched_step_is_named_after_inner() {
        let double = LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x * 2) })
            .with_name("double")
            .batched(BatchConfig::default());
        assert_eq!(double.name(), "batch(double)");
    }

    #[tokio::test]
    async fn test_cancelled_context_cancels_every_element() {
        let step = LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x) });
        let ctx = ExecutionContext::new();
        ctx.cancel();
        let results = batch(&step, vec![1, 2, 3], Some(&ctx), BatchConfig::concurrent(3)).await;
        assert!(results.iter().all(|r| r.as_ref().is_err_and(Error::is_cancelled)));
    }
}
