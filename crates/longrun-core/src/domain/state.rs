//! TaskStatus - タスクの状態
//!
//! # 状態遷移
//! - RUNNING -> COMPLETED | PAUSED | RETRYING | FAILED | CANCELLED
//! - RETRYING -> RUNNING | CANCELLED | PAUSED (crash recovery)
//! - PAUSED -> RUNNING (resume) | CANCELLED
//! - FAILED -> RUNNING (resume のみ)
//! - COMPLETED / CANCELLED からは一切遷移しない

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// A worker is executing the workflow.
    Running,

    /// Waiting out a backoff delay before the next attempt.
    Retrying,

    /// Waiting for external input or an explicit resume.
    Paused,

    /// Retries exhausted or non-retryable failure. Only `resume` leaves this state.
    Failed,

    Completed,

    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Paused,
        TaskStatus::Failed,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    /// No transition out of this state ever succeeds.
    pub fn is_hard_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Finished as far as automatic progress goes (includes soft-terminal `FAILED`).
    pub fn is_terminal(self) -> bool {
        self.is_hard_terminal() || self == TaskStatus::Failed
    }

    /// A worker owns the task right now.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Retrying)
    }

    /// Accepted by `resume`.
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct ParseTaskStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseTaskStatusError(s.to_string()))
    }
}
