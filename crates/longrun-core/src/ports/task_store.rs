//! TaskExecutionStore port - タスクの正本（source of truth）
//!
//! Store が管理するもの：
//! - メタデータ（状態・失敗理由・context）
//! - チェックポイント（最新の 1 件のみ）
//! - イベントジャーナル（追記のみ）
//!
//! # 設計原則
//! - `compare_and_set_status` がシステム全体の正しさの境界
//!   （プロセス内の `TaskMetadata` は古いコピーかもしれない）
//! - 競合負けは `Ok(None)`、I/O 失敗だけが `Err`
//! - 永続実装はレコード全体の atomic replace のみ（部分書き込み禁止）

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::{Checkpoint, StoreError, TaskEvent, TaskId, TaskMetadata, TaskStatus};

#[async_trait]
pub trait TaskExecutionStore: Send + Sync {
    /// Insert or overwrite the metadata record.
    async fn save_metadata(&self, metadata: &TaskMetadata) -> Result<(), StoreError>;

    /// Insert the record only if the task has none yet. `false` when one
    /// already exists; the stored record is left untouched.
    async fn create_metadata(&self, metadata: &TaskMetadata) -> Result<bool, StoreError>;

    async fn load_metadata(&self, task_id: TaskId) -> Result<Option<TaskMetadata>, StoreError>;

    /// Atomically move the persisted status from `expected` to `target`.
    ///
    /// Returns the updated record when the swap happened, `None` when the task
    /// is unknown or the persisted status did not allow it.
    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        target: TaskStatus,
        reason: Option<&str>,
    ) -> Result<Option<TaskMetadata>, StoreError>;

    /// Last write wins.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, task_id: TaskId) -> Result<Option<Checkpoint>, StoreError>;

    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError>;

    /// Events in append order. Empty for unknown tasks.
    async fn load_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError>;

    /// Every task that has a metadata record.
    async fn task_ids(&self) -> Result<BTreeSet<TaskId>, StoreError>;

    async fn task_ids_by_status(&self, status: TaskStatus) -> Result<BTreeSet<TaskId>, StoreError> {
        let mut matching = BTreeSet::new();
        for task_id in self.task_ids().await? {
            if let Some(metadata) = self.load_metadata(task_id).await?
                && metadata.status() == status
            {
                matching.insert(task_id);
            }
        }
        Ok(matching)
    }

    /// Remove everything stored for the task. `false` if nothing was there.
    async fn delete(&self, task_id: TaskId) -> Result<bool, StoreError>;
}
