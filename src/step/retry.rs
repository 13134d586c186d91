//! Bounded re-execution of failing units.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, ExecutionContext, Result, WorkflowEvent};
use crate::invoke::run_observed;
use super::Step;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Multiply the delay by `factor` after every attempt, capped at `max_ms`.
    Exponential {
        /// Delay after the first failure, in milliseconds.
        initial_ms: u64,
        /// Growth factor per attempt.
        factor: f64,
        /// Upper bound on any single delay, in milliseconds.
        max_ms: u64,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: usize) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, factor, max_ms } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let ms = (initial_ms as f64 * factor.powi(exponent)).min(max_ms as f64);
                Duration::from_millis(ms.max(0.0) as u64)
            }
        }
    }
}

/// Serializable part of a [`RetryPolicy`].
///
/// # Example
///
/// ```rust
/// use workunit::{Backoff, RetryConfig};
///
/// let config: RetryConfig = serde_json::from_str(
///     r#"{"max_attempts": 4, "backoff": {"kind": "fixed", "delay_ms": 250}}"#,
/// ).unwrap();
/// assert_eq!(config.backoff, Backoff::Fixed { delay_ms: 250 });
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: usize,
    /// Delay schedule between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::None,
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// How a [`RetryStep`] decides whether, and when, to try again.
///
/// By default every failure except cancellation and construction errors is
/// retried (see [`Error::is_retryable`]).
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self { config, predicate: None }
    }
}

impl RetryPolicy {
    /// Up to `max_attempts` attempts with no delay in between.
    #[must_use]
    pub fn new(max_attempts: usize) -> Self {
        RetryConfig {
            max_attempts,
            backoff: Backoff::None,
        }
        .into()
    }

    /// Up to `max_attempts` attempts, doubling from 100ms up to 10s.
    #[must_use]
    pub fn exponential(max_attempts: usize) -> Self {
        Self::new(max_attempts).with_backoff(Backoff::Exponential {
            initial_ms: 100,
            factor: 2.0,
            max_ms: 10_000,
        })
    }

    /// Replace the delay schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Only retry failures for which `predicate` holds.
    #[must_use]
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Total attempts allowed.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.config.max_attempts.max(1)
    }

    /// The serializable settings.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, error: &Error) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

/// Re-runs its inner step on failure according to a [`RetryPolicy`].
///
/// Each attempt gets a fresh clone of the input and the same context. The
/// step ends with the first success, with [`Error::Exhausted`] carrying the
/// last failure, or with `Cancelled` as soon as cancellation is observed
/// (including while waiting out a backoff).
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use workunit::{invoke, BoxedStepExt, LambdaStep, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let calls = Arc::new(AtomicUsize::new(0));
/// let seen = Arc::clone(&calls);
/// let flaky = LambdaStep::new(move |x: i32| {
///     let n = seen.fetch_add(1, Ordering::SeqCst);
///     async move {
///         if n < 2 { Err(workunit::Error::from("try again")) } else { Ok(x) }
///     }
/// })
/// .with_retry(RetryPolicy::new(5));
///
/// assert_eq!(invoke(&flaky, 9, None).await.unwrap(), 9);
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # });
/// ```
pub struct RetryStep<S> {
    inner: S,
    policy: RetryPolicy,
    name: String,
}

impl<S: Step> RetryStep<S> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        let name = format!("retry({})", inner.name());
        Self { inner, policy, name }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S> Step for RetryStep<S>
where
    S: Step,
    S::Input: Clone + 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            let error = match run_observed(&self.inner, ctx, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if error.is_cancelled() {
                return Err(error);
            }
            if attempt >= max_attempts || !self.policy.should_retry(&error) {
                warn!(unit = %self.name, attempts = attempt, error = %error, "giving up");
                return Err(Error::Exhausted {
                    unit: self.name.clone(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.config.backoff.delay(attempt);
            debug!(
                unit = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );
            ctx.record_retry();
            ctx.emit(WorkflowEvent::Retry {
                step_name: self.name.clone(),
                attempt,
                delay_ms: delay.as_millis(),
                message: error.to_string(),
            });

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = ctx.cancelled() => {
                        ctx.record_cancellation();
                        return Err(Error::cancelled(self.name.as_str()));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;
        }
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
    use crate::{invoke, BoxedStepExt, LambdaStep};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_times(
        failures: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl Step<Input = i32, Output = i32> {
        LambdaStep::new(move |x: i32| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(Error::from(format!("failure #{}", n + 1)))
                } else {
                    Ok(x)
                }
            }
        })
        .with_name("flaky")
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = failing_times(2, Arc::clone(&calls)).with_retry(RetryPolicy::new(5));
        let ctx = ExecutionContext::new();

        assert_eq!(invoke(&step, 11, Some(&ctx)).await.unwrap(), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.snapshot().retries, 2);
        assert_eq!(ctx.trace_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_always_failing_exhausts_with_last_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = failing_times(usize::MAX, Arc::clone(&calls)).with_retry(RetryPolicy::new(5));

        match invoke(&step, 0, None).await.unwrap_err() {
            Error::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(last.to_string(), "'flaky' failed: failure #5");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_predicate_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = failing_times(usize::MAX, Arc::clone(&calls))
            .with_retry(RetryPolicy::new(5).retry_if(|e| e.to_string().contains("#1")));

        let err = invoke(&step, 0, None).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = failing_times(usize::MAX, Arc::clone(&calls))
            .with_retry(RetryPolicy::new(10).with_backoff(Backoff::Fixed { delay_ms: 1_000 }));
        let ctx = ExecutionContext::new().with_timeout(Duration::from_millis(2_500));

        let err = invoke(&step, 0, Some(&ctx)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = failing_times(2, Arc::clone(&calls))
            .with_retry(RetryPolicy::new(3).with_backoff(Backoff::Fixed { delay_ms: 500 }));

        let started = tokio::time::Instant::now();
        assert_eq!(invoke(&step, 4, None).await.unwrap(), 4);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let backoff = Backoff::Exponential { initial_ms: 100, factor: 2.0, max_ms: 1_000 };
        let delays: Vec<u128> = (1..=6).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }
}
