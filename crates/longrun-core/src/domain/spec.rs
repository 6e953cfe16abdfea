//! Input specs for a task execution: `TaskConfiguration` and `CheckpointPolicy`.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metadata::TaskContext;
use super::retry::RetryPolicy;

/// When the engine writes checkpoints on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointPolicy {
    /// Never. The workflow is solely responsible for durability.
    None,

    /// On every pause and retry, plus step checkpoints requested by the workflow.
    AfterEachAgent,

    /// Never on pause, retry or completion: the scope-aware producer in the
    /// workflow layer owns checkpoints, and the engine must not overwrite them.
    AfterRootCall,
}

impl CheckpointPolicy {
    /// Engine-side checkpoint at pause / retry boundaries.
    pub fn checkpoints_lifecycle(self) -> bool {
        self == CheckpointPolicy::AfterEachAgent
    }

    /// Whether a scope-bearing checkpoint from the workflow layer is accepted.
    pub fn accepts_scope_checkpoints(self) -> bool {
        matches!(
            self,
            CheckpointPolicy::AfterEachAgent | CheckpointPolicy::AfterRootCall
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown checkpoint policy '{0}' (expected NONE, AFTER_EACH_AGENT or AFTER_ROOT_CALL)")]
pub struct ParseCheckpointPolicyError(String);

impl FromStr for CheckpointPolicy {
    type Err = ParseCheckpointPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(CheckpointPolicy::None),
            "AFTER_EACH_AGENT" => Ok(CheckpointPolicy::AfterEachAgent),
            "AFTER_ROOT_CALL" => Ok(CheckpointPolicy::AfterRootCall),
            _ => Err(ParseCheckpointPolicyError(s.to_string())),
        }
    }
}

/// Immutable settings for one execution of a task.
///
/// Supplied at `start`; `resume` may pass a new one, otherwise the resumed
/// run uses the service defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfiguration {
    pub workflow_name: String,
    pub retry_policy: RetryPolicy,

    /// `None` falls back to the service default.
    pub checkpoint_policy: Option<CheckpointPolicy>,

    /// Watchdog deadline for the whole execution (including retries).
    pub timeout: Option<Duration>,

    pub context: TaskContext,
}

impl TaskConfiguration {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            retry_policy: RetryPolicy::none(),
            checkpoint_policy: None,
            timeout: None,
            context: TaskContext::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}
