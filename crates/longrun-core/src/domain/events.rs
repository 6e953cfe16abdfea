//! Events - タスクの監査ログ
//!
//! Append-only, ordered per task. Events are written only after the matching
//! store CAS succeeded, and nothing ever reads them to decide a transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    Started,

    Resumed,

    /// External input delivered to a paused task.
    InputProvided {
        key: String,
        value: serde_json::Value,
    },

    /// Attempt `attempt` failed and another one is scheduled.
    Retried {
        attempt: u32,
        max_retries: u32,
        error: String,
        delay_ms: u64,
    },

    Paused {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_key: Option<String>,
    },

    Cancelled,

    Failed {
        reason: String,
    },

    Completed {
        /// JSON-serialized workflow result.
        result: String,
    },
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    /// Event stamped with the wall clock.
    pub fn new(task_id: TaskId, kind: TaskEventKind) -> Self {
        Self::at(task_id, kind, Utc::now())
    }

    pub fn at(task_id: TaskId, kind: TaskEventKind, at: DateTime<Utc>) -> Self {
        Self { task_id, at, kind }
    }

    /// Short name, handy for logs and assertions.
    pub fn name(&self) -> &'static str {
        match self.kind {
            TaskEventKind::Started => "started",
            TaskEventKind::Resumed => "resumed",
            TaskEventKind::InputProvided { .. } => "input_provided",
            TaskEventKind::Retried { .. } => "retried",
            TaskEventKind::Paused { .. } => "paused",
            TaskEventKind::Cancelled => "cancelled",
            TaskEventKind::Failed { .. } => "failed",
            TaskEventKind::Completed { .. } => "completed",
        }
    }
}
