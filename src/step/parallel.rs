//! Concurrent fan-out of named branches over a shared input.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::{Error, ExecutionContext, Result};
use crate::invoke::run_observed;
use super::{SharedStep, Step};

/// Branch results keyed by branch name, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchMap<O> {
    entries: Vec<(String, O)>,
}

impl<O> BranchMap<O> {
    /// The value produced by branch `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&O> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Returns `true` if a branch called `name` produced a value.
    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Branch names in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &O)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no branches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BranchMap<Value> {
    /// Convert into a JSON object.
    #[must_use]
    pub fn into_record(self) -> Map<String, Value> {
        self.entries.into_iter().collect()
    }
}

impl<O> IntoIterator for BranchMap<O> {
    type Item = (String, O);
    type IntoIter = std::vec::IntoIter<(String, O)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<O: Serialize> Serialize for BranchMap<O> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// Values of the branches that succeeded in a fan-out that failed overall.
///
/// Values keep the branch output type; read them back with
/// [`PartialResults::get`] or [`PartialResults::into_branch_map`] using the
/// `O` of the [`ParallelStep`] that produced them.
#[derive(Default)]
pub struct PartialResults {
    entries: Vec<(String, Box<dyn Any + Send + Sync>)>,
}

impl PartialResults {
    fn push<O: Send + Sync + 'static>(&mut self, name: String, value: O) {
        self.entries.push((name, Box::new(value)));
    }

    /// The value branch `name` produced, if it succeeded and has type `O`.
    #[must_use]
    pub fn get<O: 'static>(&self, name: &str) -> Option<&O> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.downcast_ref::<O>())
    }

    /// Names of the succeeded branches, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Returns `true` if a branch called `name` succeeded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    /// Number of succeeded branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no branch succeeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recover the typed values. Returns the untouched results if any value
    /// is not an `O`.
    pub fn into_branch_map<O: 'static>(self) -> std::result::Result<BranchMap<O>, Self> {
        if !self.entries.iter().all(|(_, v)| v.is::<O>()) {
            return Err(self);
        }
        let entries = self
            .entries
            .into_iter()
            .filter_map(|(k, v)| v.downcast::<O>().ok().map(|v| (k, *v)))
            .collect();
        Ok(BranchMap { entries })
    }
}

impl fmt::Debug for PartialResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Runs several named branches concurrently against the same input.
///
/// Every branch receives a clone of the input and a child context carrying
/// `branch = <name>` metadata. The step resolves once every branch has. If
/// any branch fails the result is [`Error::Branches`], which still carries
/// the successful branches' values (see [`PartialResults`]). Branches cut
/// short by cancellation are listed among the failures as `Cancelled`; only
/// when no branch finished at all does the fan-out resolve as a bare
/// `Cancelled`.
///
/// # Example
///
/// ```rust
/// use workunit::{invoke, Error, LambdaStep, ParallelStep};
///
/// # tokio_test::block_on(async {
/// let fanout = ParallelStep::builder()
///     .branch("double", LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x * 2) }))
///     .branch("negate", LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(-x) }))
///     .build()
///     .unwrap();
///
/// let out = invoke(&fanout, 5, None).await.unwrap();
/// assert_eq!(out.get("double"), Some(&10));
/// assert_eq!(out.get("negate"), Some(&-5));
/// # });
/// ```
pub struct ParallelStep<I, O> {
    branches: Vec<(String, SharedStep<I, O>)>,
    max_concurrency: Option<usize>,
    name: String,
}

impl<I, O> ParallelStep<I, O> {
    /// Start building a fan-out.
    #[must_use]
    pub fn builder() -> ParallelBuilder<I, O> {
        ParallelBuilder {
            branches: Vec::new(),
            max_concurrency: None,
            name: "parallel".to_string(),
        }
    }

    /// Branch names in declaration order.
    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|(name, _)| name.as_str())
    }
}

/// Builder for [`ParallelStep`].
pub struct ParallelBuilder<I, O> {
    branches: Vec<(String, SharedStep<I, O>)>,
    max_concurrency: Option<usize>,
    name: String,
}

impl<I, O> ParallelBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Add a branch.
    #[must_use]
    pub fn branch<S>(self, name: impl Into<String>, step: S) -> Self
    where
        S: Step<Input = I, Output = O> + 'static,
    {
        self.shared_branch(name, Arc::new(step))
    }

    /// Add a branch whose step is shared with other composites.
    #[must_use]
    pub fn shared_branch(mut self, name: impl Into<String>, step: SharedStep<I, O>) -> Self {
        self.branches.push((name.into(), step));
        self
    }

    /// Limit how many branches run at once. Without a limit the context's
    /// shared budget applies, or every branch runs at once.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Name the fan-out.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build the step. Fails if two branches share a name.
    pub fn build(self) -> Result<ParallelStep<I, O>> {
        let mut seen = HashSet::new();
        for (name, _) in &self.branches {
            if !seen.insert(name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate branch name '{name}' in '{}'",
                    self.name
                )));
            }
        }
        Ok(ParallelStep {
            branches: self.branches,
            max_concurrency: self.max_concurrency,
            name: self.name,
        })
    }
}

#[async_trait]
impl<I, O> Step for ParallelStep<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    type Input = I;
    type Output = BranchMap<O>;

    async fn run(&self, ctx: &ExecutionContext, input: I) -> Result<BranchMap<O>> {
        let limit = self
            .max_concurrency
            .or(ctx.max_concurrency())
            .unwrap_or(self.branches.len())
            .max(1);
        debug!(unit = %self.name, branches = self.branches.len(), limit, "fanning out");

        let branches: Vec<_> = self
            .branches
            .iter()
            .map(|(name, step)| {
                let name = name.clone();
                let step = Arc::clone(step);
                let branch_ctx = ctx.child().with_metadata("branch", name.as_str());
                let input = input.clone();
                async move {
                    let result = run_observed(step.as_ref(), &branch_ctx, input).await;
                    (name, result)
                }
            })
            .collect();
        let outcomes: Vec<(String, Result<O>)> =
            stream::iter(branches).buffered(limit).collect().await;

        if outcomes.iter().all(|(_, r)| r.is_ok()) {
            let entries = outcomes
                .into_iter()
                .filter_map(|(name, r)| r.ok().map(|v| (name, v)))
                .collect();
            return Ok(BranchMap { entries });
        }
        // Nothing finished before cancellation: there is nothing to report.
        if outcomes.iter().all(|(_, r)| r.as_ref().is_err_and(Error::is_cancelled)) {
            return Err(Error::cancelled(self.name.as_str()));
        }

        let mut failed = Vec::new();
        let mut succeeded = PartialResults::default();
        for (name, result) in outcomes {
            match result {
                Ok(value) => succeeded.push(name, value),
                Err(e) => failed.push((name, e)),
            }
        }
        debug!(unit = %self.name, failed = failed.len(), "fan-out finished with failures");
        Err(Error::Branches {
            unit: self.name.clone(),
            failed,
            succeeded,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_cancellation(&self) -> bool {
        true
    }
}
