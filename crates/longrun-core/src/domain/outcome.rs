//! Outcome model: what one workflow invocation produced.
//!
//! The workflow never "throws" a pause. It returns one of three variants and
//! the worker matches on them, so pause vs. failure is an explicit branch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a workflow failure, matched against a retry allow-list.
///
/// Free-form on purpose: the workflow layer owns the vocabulary
/// (`"io"`, `"rate_limited"`, `"validation"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureKind(String);

impl FailureKind {
    /// Kind used when the workflow does not classify its failure.
    pub const GENERIC: &'static str = "generic";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn generic() -> Self {
        Self::new(Self::GENERIC)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An ordinary (retryable-by-policy) workflow failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkflowFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkflowFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::new(kind),
            message: message.into(),
        }
    }

    /// Unclassified failure.
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::generic(),
            message: message.into(),
        }
    }
}

/// The workflow needs external input before it can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("paused: {reason}")]
pub struct PauseSignal {
    /// Human-readable reason.
    pub reason: String,

    /// Key of the external input being awaited, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_key: Option<String>,
}

impl PauseSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            input_key: None,
        }
    }

    pub fn awaiting(reason: impl Into<String>, input_key: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            input_key: Some(input_key.into()),
        }
    }
}

/// Result of a single workflow invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(serde_json::Value),
    Paused(PauseSignal),
    Failed(WorkflowFailure),
}

impl Outcome {
    pub fn completed(value: impl Into<serde_json::Value>) -> Self {
        Outcome::Completed(value.into())
    }

    pub fn paused(reason: impl Into<String>, input_key: impl Into<String>) -> Self {
        Outcome::Paused(PauseSignal::awaiting(reason, input_key))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed(WorkflowFailure::generic(message))
    }

    pub fn failed_with(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Failed(WorkflowFailure::new(kind, message))
    }
}

impl<E> From<Result<serde_json::Value, E>> for Outcome
where
    E: std::error::Error,
{
    /// Adapts `?`-style workflow code: any error becomes a generic failure.
    fn from(result: Result<serde_json::Value, E>) -> Self {
        match result {
            Ok(value) => Outcome::Completed(value),
            Err(e) => Outcome::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display_includes_kind() {
        let f = WorkflowFailure::new("io", "connection reset");
        assert_eq!(f.to_string(), "io: connection reset");
        assert_eq!(WorkflowFailure::generic("x").kind.as_str(), "generic");
    }

    #[test]
    fn pause_constructors() {
        let p = PauseSignal::awaiting("needs approval", "approval");
        assert_eq!(p.input_key.as_deref(), Some("approval"));
        assert_eq!(PauseSignal::new("later").input_key, None);
    }

    #[test]
    fn result_conversion() {
        let ok: Result<serde_json::Value, std::io::Error> = Ok(serde_json::json!(1));
        assert_eq!(Outcome::from(ok), Outcome::Completed(serde_json::json!(1)));

        let err: Result<serde_json::Value, std::io::Error> =
            Err(std::io::Error::other("disk gone"));
        match Outcome::from(err) {
            Outcome::Failed(f) => assert_eq!(f.message, "disk gone"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
