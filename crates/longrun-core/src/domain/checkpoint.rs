//! Checkpoint: metadata snapshot plus the workflow layer's opaque scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::metadata::TaskMetadata;

/// Last-write-wins snapshot of a task.
///
/// `scope` belongs to the workflow layer. The engine's own pause/retry
/// checkpoints (`AFTER_EACH_AGENT` only) carry forward whatever scope was
/// stored last, so they never erase workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: TaskMetadata,

    #[serde(default)]
    pub scope: Option<serde_json::Value>,

    pub taken_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot stamped with the wall clock.
    pub fn new(metadata: TaskMetadata, scope: Option<serde_json::Value>) -> Self {
        Self::taken_at(metadata, scope, Utc::now())
    }

    pub fn taken_at(
        metadata: TaskMetadata,
        scope: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata,
            scope,
            taken_at: at,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.metadata.id()
    }

    pub fn has_scope(&self) -> bool {
        self.scope.is_some()
    }
}
