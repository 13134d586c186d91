//! Error types for work unit execution.
//!
//! Every failure a caller can observe is an [`Error`]. Wrapped computations
//! usually produce the unattributed [`Error::Message`] (via `From<&str>` /
//! `From<String>`); the invocation engine turns those into
//! [`Error::Execution`] naming the unit that raised them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::parallel::PartialResults;

/// The main error type for work unit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A wrapped computation failed.
    #[error("'{unit}' failed: {message}")]
    Execution {
        /// Name of the unit that raised the failure.
        unit: String,
        /// Description of the failure.
        message: String,
    },

    /// Cancellation (or an expired deadline) was observed.
    #[error("'{unit}' was cancelled")]
    Cancelled {
        /// Name of the unit that observed the cancellation.
        unit: String,
    },

    /// Two composed units disagree on the type flowing between them.
    #[error("Type mismatch at '{stage}': expected {expected}, found {found}")]
    TypeMismatch {
        /// The stage whose input (or the pipeline end) did not line up.
        stage: String,
        /// The type the stage declares.
        expected: &'static str,
        /// The type actually supplied.
        found: &'static str,
    },

    /// A retried unit used up its attempt budget.
    #[error("'{unit}' exhausted {attempts} attempt(s): {last}")]
    Exhausted {
        /// Name of the retried unit.
        unit: String,
        /// Number of attempts made.
        attempts: usize,
        /// The failure observed on the final attempt.
        #[source]
        last: Box<Error>,
    },

    /// A primary unit and every alternate failed.
    #[error("'{unit}' failed along with all {} alternate(s)", .failures.len().saturating_sub(1))]
    AllFallbacksFailed {
        /// Name of the fallback composite.
        unit: String,
        /// Every attempted unit's failure, primary first.
        failures: Vec<Error>,
    },

    /// One or more parallel branches failed.
    #[error("{} branch(es) of '{unit}' failed: {}", .failed.len(), branch_names(.failed))]
    Branches {
        /// Name of the fan-out composite.
        unit: String,
        /// Failed branches, in declaration order.
        failed: Vec<(String, Error)>,
        /// Branches that succeeded, with their typed values.
        succeeded: PartialResults,
    },

    /// A composite was constructed with invalid parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic error with a message, not yet attributed to a unit.
    #[error("{0}")]
    Message(String),
}

fn branch_names(failed: &[(String, Error)]) -> String {
    failed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coarse classification of an [`Error`], matching the failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The wrapped computation raised an error.
    ExecutionFailure,
    /// Cancellation was observed.
    Cancelled,
    /// Incompatible signatures at composition time.
    TypeMismatch,
    /// Retry budget used up.
    Exhausted,
    /// Every fallback failed.
    AllFallbacksFailed,
    /// A fan-out finished with failed branches.
    BranchFailure,
    /// Invalid construction parameters.
    Validation,
}

impl Error {
    /// Build an attributed execution failure.
    pub fn execution(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Build a cancellation failure observed by `unit`.
    pub fn cancelled(unit: impl Into<String>) -> Self {
        Error::Cancelled { unit: unit.into() }
    }

    /// Attach `unit` as the failing unit if the error does not name one yet.
    #[must_use]
    pub fn attribute(self, unit: &str) -> Self {
        match self {
            Error::Message(message) => Error::execution(unit, message),
            Error::Json(e) => Error::execution(unit, e.to_string()),
            other => other,
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Execution { .. } | Error::Json(_) | Error::Message(_) => {
                FailureKind::ExecutionFailure
            }
            Error::Cancelled { .. } => FailureKind::Cancelled,
            Error::TypeMismatch { .. } => FailureKind::TypeMismatch,
            Error::Exhausted { .. } => FailureKind::Exhausted,
            Error::AllFallbacksFailed { .. } => FailureKind::AllFallbacksFailed,
            Error::Branches { .. } => FailureKind::BranchFailure,
            Error::Validation(_) => FailureKind::Validation,
        }
    }

    /// The unit (stage, branch composite, retried unit...) that raised this error.
    #[must_use]
    pub fn failing_unit(&self) -> Option<&str> {
        match self {
            Error::Execution { unit, .. }
            | Error::Cancelled { unit }
            | Error::Exhausted { unit, .. }
            | Error::AllFallbacksFailed { unit, .. }
            | Error::Branches { unit, .. } => Some(unit),
            Error::TypeMismatch { stage, .. } => Some(stage),
            Error::Validation(_) | Error::Json(_) | Error::Message(_) => None,
        }
    }

    /// Returns `true` if this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Whether a retry could plausibly succeed. Cancellation and construction
    /// errors are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            FailureKind::Cancelled | FailureKind::TypeMismatch | FailureKind::Validation
        )
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for work unit operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_only_names_unattributed_errors() {
        let err = Error::from("boom").attribute("parse");
        assert_eq!(err.failing_unit(), Some("parse"));
        assert_eq!(err.to_string(), "'parse' failed: boom");

        let err = err.attribute("outer");
        assert_eq!(err.failing_unit(), Some("parse"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::from("transient").is_retryable());
        assert!(!Error::cancelled("x").is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert_eq!(Error::cancelled("x").kind(), FailureKind::Cancelled);
    }

    #[test]
    fn test_branch_failure_lists_names() {
        let err = Error::Branches {
            unit: "fanout".to_string(),
            failed: vec![
                ("a".to_string(), Error::from("x")),
                ("c".to_string(), Error::from("y")),
            ],
            succeeded: PartialResults::default(),
        };
        assert_eq!(err.to_string(), "2 branch(es) of 'fanout' failed: a, c");
        assert_eq!(err.kind(), FailureKind::BranchFailure);
    }
}
