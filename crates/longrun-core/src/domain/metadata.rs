//! Task metadata: the state-machine record of one task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskStatus;

/// Opaque, caller-owned context carried with a task.
pub type TaskContext = BTreeMap<String, serde_json::Value>;

/// Persisted record for one task.
///
/// Design:
/// - `compare_and_transition` is the only mutator once the task exists.
/// - The copy a worker holds may be stale; the store CAS is what decides who won.
/// - `created_at` comes from the service clock. `updated_at` is stamped by
///   the store at CAS time with the wall clock, so a fixed test clock does
///   not pin it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    id: TaskId,
    workflow_name: String,
    #[serde(default)]
    context: TaskContext,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskMetadata {
    /// New record in `RUNNING`.
    pub fn create(
        id: TaskId,
        workflow_name: impl Into<String>,
        context: TaskContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_name: workflow_name.into(),
            context,
            status: TaskStatus::Running,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Unconditional status write. Only used while building a fresh record.
    pub fn transition_to(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Swap `expected -> target` if the current status is `expected`.
    ///
    /// Always refuses when the current status is hard-terminal, even if
    /// `expected` names that very status. The failure reason is replaced by
    /// `reason` (cleared when `None`).
    pub fn compare_and_transition(
        &mut self,
        expected: TaskStatus,
        target: TaskStatus,
        reason: Option<&str>,
    ) -> bool {
        if self.status.is_hard_terminal() || self.status != expected {
            return false;
        }
        self.status = target;
        self.failure_reason = reason.map(str::to_string);
        self.updated_at = Utc::now();
        true
    }
}
