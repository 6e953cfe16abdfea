//! InMemoryTaskStore - 揮発性の store（テスト・単一プロセス用）
//!
//! 1 つの Mutex で全レコードを守る。CAS は「ロック → 読む → 比較 → 書く」を
//! ロック内で完結させるので、同じプロセス内の呼び出し同士では atomic。

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Checkpoint, StoreError, TaskEvent, TaskId, TaskMetadata, TaskStatus};
use crate::ports::TaskExecutionStore;

#[derive(Default)]
struct InMemoryState {
    /// Metadata records (the set of known tasks).
    records: HashMap<TaskId, TaskMetadata>,

    checkpoints: HashMap<TaskId, Checkpoint>,

    /// Journals, in append order.
    events: HashMap<TaskId, Vec<TaskEvent>>,
}

/// Volatile `TaskExecutionStore`. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutionStore for InMemoryTaskStore {
    async fn save_metadata(&self, metadata: &TaskMetadata) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.records.insert(metadata.id(), metadata.clone());
        Ok(())
    }

    async fn create_metadata(&self, metadata: &TaskMetadata) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.entry(metadata.id()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(metadata.clone());
                Ok(true)
            }
        }
    }

    async fn load_metadata(&self, task_id: TaskId) -> Result<Option<TaskMetadata>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&task_id).cloned())
    }

    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        target: TaskStatus,
        reason: Option<&str>,
    ) -> Result<Option<TaskMetadata>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&task_id) else {
            return Ok(None);
        };
        if !record.compare_and_transition(expected, target, reason) {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .checkpoints
            .insert(checkpoint.task_id(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, task_id: TaskId) -> Result<Option<Checkpoint>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(&task_id).cloned())
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .events
            .entry(event.task_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events.get(&task_id).cloned().unwrap_or_default())
    }

    async fn task_ids(&self) -> Result<BTreeSet<TaskId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.keys().copied().collect())
    }

    async fn task_ids_by_status(&self, status: TaskStatus) -> Result<BTreeSet<TaskId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|m| m.status() == status)
            .map(TaskMetadata::id)
            .collect())
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.records.remove(&task_id).is_some();
        let had_checkpoint = state.checkpoints.remove(&task_id).is_some();
        let had_events = state.events.remove(&task_id).is_some();
        Ok(existed || had_checkpoint || had_events)
    }
}
