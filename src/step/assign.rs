//! Field assignment over record-shaped data.
//!
//! [`AssignStep`] runs a base unit producing a [`Record`], evaluates a set of
//! field units against that record concurrently, and merges their values
//! back in under the field names.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::marker::PhantomData;

use crate::{ExecutionContext, Result};
use crate::invoke::run_observed;
use super::parallel::{ParallelBuilder, ParallelStep};
use super::Step;

/// A structured record: a JSON object.
pub type Record = Map<String, Value>;

/// A step that returns its input unchanged.
///
/// Use it as the base of an [`AssignStep`] to assign fields onto the
/// caller's own record.
pub struct Passthrough<T> {
    _phantom: PhantomData<fn(T) -> T>,
}

impl<T> Passthrough<T> {
    /// Create an identity step.
    #[must_use]
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl<T> Default for Passthrough<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Step for Passthrough<T> {
    type Input = T;
    type Output = T;

    async fn run(&self, _ctx: &ExecutionContext, input: T) -> Result<T> {
        Ok(input)
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Extends a base step's record output with computed fields.
///
/// Every field unit receives the record as produced by the base (never a
/// sibling field's value), and all of them run concurrently like the
/// branches of a [`ParallelStep`]. Field values are then merged in
/// declaration order; an existing key with the same name is overwritten.
///
/// # Example
///
/// ```rust
/// use serde_json::{json, Value};
/// use workunit::{invoke, AssignStep, LambdaStep, Record};
///
/// fn power(n: u32) -> impl workunit::Step<Input = Record, Output = Value> {
///     LambdaStep::new(move |r: Record| async move {
///         let x = r.get("x").and_then(Value::as_i64).ok_or("x must be an integer")?;
///         Ok::<Value, workunit::Error>(json!(x.pow(n)))
///     })
/// }
///
/// # tokio_test::block_on(async {
/// let base = LambdaStep::new(|_: ()| async move {
///     Ok::<Record, workunit::Error>(json!({"x": 4}).as_object().cloned().unwrap_or_default())
/// });
/// let step = AssignStep::builder(base)
///     .field("square", power(2))
///     .field("cube", power(3))
///     .build()
///     .unwrap();
///
/// let out = invoke(&step, (), None).await.unwrap();
/// assert_eq!(Value::Object(out), json!({"x": 4, "square": 16, "cube": 64}));
/// # });
/// ```
pub struct AssignStep<B> {
    base: B,
    fields: ParallelStep<Record, Value>,
    name: String,
}

impl<B: Step<Output = Record>> AssignStep<B> {
    /// Start building an assignment over `base`.
    #[must_use]
    pub fn builder(base: B) -> AssignBuilder<B> {
        let name = format!("assign({})", base.name());
        AssignBuilder {
            base,
            fields: ParallelStep::builder().name(name.clone()),
            name,
        }
    }
}

/// Builder for [`AssignStep`].
pub struct AssignBuilder<B> {
    base: B,
    fields: ParallelBuilder<Record, Value>,
    name: String,
}

impl<B: Step<Output = Record>> AssignBuilder<B> {
    /// Compute field `name` from the base record with `step`.
    #[must_use]
    pub fn field<S>(mut self, name: impl Into<String>, step: S) -> Self
    where
        S: Step<Input = Record, Output = Value> + 'static,
    {
        self.fields = self.fields.branch(name, step);
        self
    }

    /// Limit how many field units run at once.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.fields = self.fields.max_concurrency(limit);
        self
    }

    /// Build the step. Fails if two fields share a name.
    pub fn build(self) -> Result<AssignStep<B>> {
        Ok(AssignStep {
            base: self.base,
            fields: self.fields.build()?,
            name: self.name,
        })
    }
}

#[async_trait]
impl<B> Step for AssignStep<B>
where
    B: Step<Output = Record>,
    B::Input: 'static,
{
    type Input = B::Input;
    type Output = Record;

    async fn run(&self, ctx: &ExecutionContext, input: B::Input) -> Result<Record> {
        let mut record = run_observed(&self.base, ctx, input).await?;
        let values = run_observed(&self.fields, ctx, record.clone()).await?;
        for (key, value) in values {
            record.insert(key, value);
        }
        Ok(record)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_cancellation(&self) -> bool {
        true
    }
}
