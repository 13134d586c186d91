//! Runtime-assembled chains with construction-time type checking.
//!
//! [`ChainStep`](super::chain::ChainStep) checks stage compatibility at
//! compile time. When the list of stages is only known at runtime (read
//! from configuration, say), [`Pipeline`] erases each stage and checks the
//! declared types of neighbouring stages when it is built, so a malformed
//! pipeline is rejected before any stage runs.

use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;

use crate::{Error, ExecutionContext, Result};
use crate::invoke::run_observed;
use super::Step;

type AnyValue = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy)]
struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

#[async_trait]
trait ErasedStep: Send + Sync {
    fn name(&self) -> &str;
    fn input(&self) -> TypeTag;
    fn output(&self) -> TypeTag;
    async fn run_erased(&self, ctx: &ExecutionContext, input: AnyValue) -> Result<AnyValue>;
}

struct Erased<S>(S);

#[async_trait]
impl<S> ErasedStep for Erased<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    fn input(&self) -> TypeTag {
        TypeTag::of::<S::Input>()
    }

    fn output(&self) -> TypeTag {
        TypeTag::of::<S::Output>()
    }

    async fn run_erased(&self, ctx: &ExecutionContext, input: AnyValue) -> Result<AnyValue> {
        let input = input.downcast::<S::Input>().map_err(|_| Error::TypeMismatch {
            stage: self.0.name().to_string(),
            expected: type_name::<S::Input>(),
            found: "<erased value>",
        })?;
        let output = run_observed(&self.0, ctx, *input).await?;
        Ok(Box::new(output))
    }
}

/// Collects stages for a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn ErasedStep>>,
    name: Option<String>,
}

impl PipelineBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    #[must_use]
    pub fn stage<S>(mut self, step: S) -> Self
    where
        S: Step + 'static,
        S::Input: 'static,
        S::Output: 'static,
    {
        self.stages.push(Box::new(Erased(step)));
        self
    }

    /// Name the pipeline. Defaults to the stage names joined by `" | "`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of stages collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if no stage has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check every boundary and produce a `Step<Input = I, Output = O>`.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if there are no stages, and
    /// [`Error::TypeMismatch`] if the first stage does not accept `I`, a stage
    /// does not accept its predecessor's output, or the last stage does not
    /// produce `O`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use workunit::{Error, LambdaStep, Pipeline};
    ///
    /// let parse = LambdaStep::new(|s: String| async move {
    ///     s.trim().parse::<i64>().map_err(|e| Error::from(e.to_string()))
    /// }).with_name("parse");
    /// let shout = LambdaStep::new(|s: String| async move {
    ///     Ok::<String, Error>(s.to_uppercase())
    /// })
    /// .with_name("shout");
    ///
    /// let built = Pipeline::builder().stage(parse).stage(shout).build::<String, String>();
    /// let err = built.err().unwrap();
    /// assert!(matches!(err, Error::TypeMismatch { ref stage, .. } if stage == "shout"));
    /// ```
    pub fn build<I, O>(self) -> Result<Pipeline<I, O>>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let (first, last) = match (self.stages.first(), self.stages.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::Validation("pipeline has no stages".to_string())),
        };

        let expected_input = TypeTag::of::<I>();
        if first.input().id != expected_input.id {
            return Err(Error::TypeMismatch {
                stage: first.name().to_string(),
                expected: first.input().name,
                found: expected_input.name,
            });
        }
        for pair in self.stages.windows(2) {
            let (produced, next) = (pair[0].output(), &pair[1]);
            if produced.id != next.input().id {
                return Err(Error::TypeMismatch {
                    stage: next.name().to_string(),
                    expected: next.input().name,
                    found: produced.name,
                });
            }
        }
        let expected_output = TypeTag::of::<O>();
        if last.output().id != expected_output.id {
            return Err(Error::TypeMismatch {
                stage: "<pipeline output>".to_string(),
                expected: expected_output.name,
                found: last.output().name,
            });
        }

        let name = self.name.unwrap_or_else(|| {
            self.stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" | ")
        });
        Ok(Pipeline {
            stages: self.stages,
            name,
            _phantom: PhantomData,
        })
    }
}

/// A type-checked chain of runtime-assembled stages.
///
/// Behaves exactly like the equivalent nesting of
/// [`ChainStep`](super::chain::ChainStep)s: stages run in order and the first
/// failure short-circuits.
pub struct Pipeline<I, O> {
    stages: Vec<Box<dyn ErasedStep>>,
    name: String,
    _phantom: PhantomData<fn(I) -> O>,
}

impl Pipeline<(), ()> {
    /// Start collecting stages.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }
}

impl<I, O> Pipeline<I, O> {
    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false`: a built pipeline has at least one stage.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl<I, O> Step for Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, ctx: &ExecutionContext, input: I) -> Result<O> {
        let mut value: AnyValue = Box::new(input);
        for stage in &self.stages {
            value = stage.run_erased(ctx, value).await?;
        }
        value
            .downcast::<O>()
            .map(|output| *output)
            .map_err(|_| Error::TypeMismatch {
                stage: "<pipeline output>".to_string(),
                expected: type_name::<O>(),
                found: "<erased value>",
            })
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

    fn add_three() -> impl Step<Input = i32, Output = i32> {
        LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x + 3) }).with_name("add_three")
    }

    fn times_ten() -> impl Step<Input = i32, Output = i32> {
        LambdaStep::new(|x: i32| async move { Ok::<i32, Error>(x * 10) }).with_name("times_ten")
    }

    fn render() -> impl Step<Input = i32, Output = String> {
        LambdaStep::new(|x: i32| async move { Ok::<String, Error>(format!("<{x}>")) })
            .with_name("render")
    }

    #[tokio::test]
    async fn test_runs_like_static_chain() {
        let dynamic = Pipeline::builder()
            .stage(add_three())
            .stage(times_ten())
            .stage(render())
            .build::<i32, String>()
            .unwrap();
        let fixed = add_three().then(times_ten()).then(render());

        assert_eq!(invoke(&dynamic, 4, None).await.unwrap(), "<70>");
        assert_eq!(invoke(&fixed, 4, None).await.unwrap(), "<70>");
        assert_eq!(dynamic.name(), fixed.name());
    }

    #[test]
    fn test_mismatched_boundary_rejected() {
        let err = Pipeline::builder()
            .stage(render())
            .stage(times_ten())
            .build::<i32, i32>()
            .err()
            .unwrap();
        match err {
            Error::TypeMismatch { stage, expected, found } => {
                assert_eq!(stage, "times_ten");
                assert_eq!(expected, "i32");
                assert_eq!(found, type_name::<String>());
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_declared_ends_are_checked() {
        let wrong_input = Pipeline::builder().stage(add_three()).build::<u8, i32>();
        assert!(matches!(wrong_input, Err(Error::TypeMismatch { .. })));

        let wrong_output = Pipeline::builder().stage(add_three()).build::<i32, String>();
        assert!(matches!(wrong_output, Err(Error::TypeMismatch { .. })));

        let empty = Pipeline::builder().build::<i32, i32>();
        assert!(matches!(empty, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_short_circuits_on_failure() {
        let broken = LambdaStep::new(|_: i32| async move { Err::<i32, _>(Error::from("overflow")) })
            .with_name("broken");
        let pipeline = Pipeline::builder()
            .stage(add_three())
            .stage(broken)
            .stage(render())
            .build::<i32, String>()
            .unwrap();

        let err = invoke(&pipeline, 1, None).await.unwrap_err();
        assert_eq!(err.failing_unit(), Some("broken"));
    }
}
