//! Streaming units and the stream executor.
//!
//! A [`StreamStep`] produces its output incrementally as a pull-based
//! [`StepStream`]. Streaming is a capability on top of [`Step`]: the `run`
//! of a streaming unit yields the accumulated result, while [`stream`] hands
//! out elements one at a time. Plain units become one-element streams
//! through [`OnceStream`].

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use std::marker::PhantomData;

use crate::{Error, ExecutionContext, Result, step::Step};

/// A lazy, single-pass sequence of results.
pub type StepStream<'a, T> = BoxStream<'a, Result<T>>;

/// A unit that can expose its output as a stream of elements.
pub trait StreamStep: Step {
    /// The element type of the stream.
    type Item: Send;

    /// Start the computation and return its elements as a stream.
    ///
    /// Nothing runs until the stream is first polled. Dropping the stream
    /// drops the computation along with any resources it holds.
    fn stream<'a>(
        &'a self,
        ctx: &ExecutionContext,
        input: Self::Input,
    ) -> StepStream<'a, Self::Item>;
}

/// Stream the elements `step` produces for `input`.
///
/// Cancellation is checked before each element and raced against the
/// pending one; once observed, a single `Cancelled` failure is yielded and
/// the stream ends. A failure from the unit is yielded and ends the stream
/// too.
///
/// # Example
///
/// ```rust
/// use futures::{stream, TryStreamExt};
/// use workunit::{stream, LambdaStreamStep};
///
/// # tokio_test::block_on(async {
/// let countdown = LambdaStreamStep::new(|n: u32| {
///     stream::iter((1..=n).rev().map(Ok::<u32, workunit::Error>))
/// });
/// let items: Vec<u32> = stream(&countdown, 3, None).try_collect().await.unwrap();
/// assert_eq!(items, vec![3, 2, 1]);
/// # });
/// ```
pub fn stream<'a, S>(
    step: &'a S,
    input: S::Input,
    ctx: Option<&ExecutionContext>,
) -> StepStream<'a, S::Item>
where
    S: StreamStep + ?Sized,
    S::Item: 'a,
{
    let ctx = ctx.cloned().unwrap_or_default();
    let inner = step.stream(&ctx, input);
    guarded(inner, ctx, step.name().to_string())
}

struct Guard<'a, T> {
    inner: StepStream<'a, T>,
    ctx: ExecutionContext,
    unit: String,
    done: bool,
}

fn guarded<'a, T: Send + 'a>(
    inner: StepStream<'a, T>,
    ctx: ExecutionContext,
    unit: String,
) -> StepStream<'a, T> {
    let state = Guard { inner, ctx, unit, done: false };
    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        let next = if st.ctx.is_cancelled() {
            Some(Err(Error::cancelled(st.unit.as_str())))
        } else {
            tokio::select! {
                biased;
                () = st.ctx.cancelled() => Some(Err(Error::cancelled(st.unit.as_str()))),
                item = st.inner.next() => item,
            }
        };
        match next {
            None => None,
            Some(Ok(item)) => Some((Ok(item), st)),
            Some(Err(e)) => {
                if e.is_cancelled() {
                    st.ctx.record_cancellation();
                }
                st.done = true;
                let e = e.attribute(&st.unit);
                Some((Err(e), st))
            }
        }
    })
    .boxed()
}

/// A streaming unit constructed from a closure returning a [`Stream`].
///
/// Its [`Step::run`] collects the whole stream into a `Vec`.
///
/// # Example
///
/// ```rust
/// use futures::stream;
/// use workunit::{LambdaStreamStep, Step, ExecutionContext};
///
/// # tokio_test::block_on(async {
/// let words = LambdaStreamStep::new(|text: String| {
///     let words: Vec<_> = text
///         .split_whitespace()
///         .map(|w| Ok::<String, workunit::Error>(w.to_string()))
///         .collect();
///     stream::iter(words)
/// });
/// let all = words.run(&ExecutionContext::new(), "a b c".to_string()).await.unwrap();
/// assert_eq!(all, vec!["a", "b", "c"]);
/// # });
/// ```
pub struct LambdaStreamStep<I, O, F> {
    f: F,
    name: String,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F, St> LambdaStreamStep<I, O, F>
where
    F: Fn(I) -> St + Send + Sync + 'static,
    St: Stream<Item = Result<O>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a new streaming step from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: "lambda_stream".to_string(),
            _phantom: PhantomData,
        }
    }

    /// Name this step.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<I, O, F, St> Step for LambdaStreamStep<I, O, F>
where
    F: Fn(I) -> St + Send + Sync + 'static,
    St: Stream<Item = Result<O>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = Vec<O>;

    async fn run(&self, _ctx: &ExecutionContext, input: I) -> Result<Vec<O>> {
        (self.f)(input).try_collect().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<I, O, F, St> StreamStep for LambdaStreamStep<I, O, F>
where
    F: Fn(I) -> St + Send + Sync + 'static,
    St: Stream<Item = Result<O>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    type Item = O;

    fn stream<'a>(&'a self, _ctx: &ExecutionContext, input: I) -> StepStream<'a, O> {
        (self.f)(input).boxed()
    }
}

/// Presents a plain unit's single output as a one-element stream.
///
/// Constructed via [`BoxedStepExt::into_stream`](crate::BoxedStepExt::into_stream).
pub struct OnceStream<S> {
    step: S,
}

impl<S> OnceStream<S> {
    /// Wrap `step`.
    pub fn new(step: S) -> Self {
        Self { step }
    }
}

#[async_trait]
impl<S> Step for OnceStream<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        self.step.run(ctx, input).await
    }

    fn name(&self) -> &str {
        self.step.name()
    }

    fn observes_cancellation(&self) -> bool {
        self.step.observes_cancellation()
    }
}

impl<S> StreamStep for OnceStream<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    type Item = S::Output;

    fn stream<'a>(&'a self, ctx: &ExecutionContext, input: S::Input) -> StepStream<'a, S::Output> {
        let ctx = ctx.clone();
        stream::once(async move { self.step.run(&ctx, input).await }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxedStepExt, LambdaStep};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Release(Arc<AtomicBool>);

    impl Drop for Release {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_elements_are_pulled_lazily() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let naturals = LambdaStreamStep::new(move |start: u64| {
            let counter = Arc::clone(&counter);
            stream::iter(start..).map(move |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, Error>(n)
            })
        });

        let first: Vec<u64> = stream(&naturals, 10, None)
            .take(3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, vec![10, 11, 12]);
        assert_eq!(produced.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_reproduces_sequence_and_matches_run() {
        let letters = LambdaStreamStep::new(|n: usize| {
            stream::iter((0..n).map(|i| Ok::<char, Error>((b'a' + i as u8) as char)))
        });
        let ctx = ExecutionContext::new();

        let once: Vec<char> = stream(&letters, 4, Some(&ctx)).try_collect().await.unwrap();
        let twice: Vec<char> = stream(&letters, 4, Some(&ctx)).try_collect().await.unwrap();
        let accumulated = letters.run(&ctx, 4).await.unwrap();

        assert_eq!(once, vec!['a', 'b', 'c', 'd']);
        assert_eq!(once, twice);
        assert_eq!(once, accumulated);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_resources() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let source = LambdaStreamStep::new(move |_: ()| {
            let guard = Release(Arc::clone(&flag));
            stream::iter(0..).map(move |n: i32| {
                let _held = &guard;
                Ok::<i32, Error>(n)
            })
        });

        let mut items = stream(&source, (), None);
        assert_eq!(items.next().await.unwrap().unwrap(), 0);
        assert!(!released.load(Ordering::SeqCst));
        drop(items);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_ends_stream() {
        let source = LambdaStreamStep::new(|_: ()| stream::iter(0..).map(Ok::<i32, Error>))
            .with_name("ticker");
        let ctx = ExecutionContext::new();
        let mut items = stream(&source, (), Some(&ctx));

        assert_eq!(items.next().await.unwrap().unwrap(), 0);
        ctx.cancel();
        let err = items.next().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.failing_unit(), Some("ticker"));
        assert!(items.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_pending_element() {
        let source = LambdaStreamStep::new(|_: ()| {
            stream::iter(0..).then(|n: i32| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<i32, Error>(n)
            })
        });
        let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(15));
        let results: Vec<Result<i32>> = stream(&source, (), Some(&ctx)).collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(results[1].as_ref().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_ends_stream() {
        let source = LambdaStreamStep::new(|_: ()| {
            stream::iter(vec![Ok(1), Err(Error::from("broken pipe")), Ok(3)])
        })
        .with_name("reader");
        let results: Vec<Result<i32>> = stream(&source, (), None).collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[1].as_ref().unwrap_err().failing_unit(), Some("reader"));
    }

    #[tokio::test]
    async fn test_once_stream_coerces_plain_unit() {
        let square = LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x * x) }).into_stream();
        let items: Vec<i32> = stream(&square, 7, None).try_collect().await.unwrap();
        assert_eq!(items, vec![49]);
    }
}
