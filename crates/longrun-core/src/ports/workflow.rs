//! Workflow port - エンジンが実行する不透明な処理単位
//!
//! エンジンは workflow が「何をするか」を知らない。
//! 1 回の呼び出しで `Outcome`（Completed / Paused / Failed）を返すことだけを要求する。
//! リトライ時は同じ workflow が再度呼ばれる（at-least-once）。

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    Checkpoint, CheckpointPolicy, Outcome, StoreError, TaskEventKind, TaskId,
};
use crate::ports::{Clock, TaskExecutionStore};

/// The unit of work wrapped by the engine.
///
/// # 使用例
/// ```ignore
/// let handle = service
///     .start(TaskConfiguration::new("summarize"), |ctx: WorkflowContext| async move {
///         Outcome::completed(serde_json::json!({ "attempt": ctx.attempt() }))
///     })
///     .await?;
/// ```
///
/// Any `Fn(WorkflowContext) -> impl Future<Output = Outcome>` is a workflow.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(&self, ctx: WorkflowContext) -> Outcome;
}

#[async_trait]
impl<F, Fut> Workflow for F
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn run(&self, ctx: WorkflowContext) -> Outcome {
        (self)(ctx).await
    }
}

/// What a workflow invocation gets to see of the engine.
///
/// Checkpoint helpers are the hook for the external scope producer: they
/// write scope-bearing checkpoints straight to the store, gated by the
/// execution's `CheckpointPolicy`.
#[derive(Clone)]
pub struct WorkflowContext {
    task_id: TaskId,
    attempt: u32,
    checkpoint_policy: CheckpointPolicy,
    store: Arc<dyn TaskExecutionStore>,
    clock: Arc<dyn Clock>,
}

impl WorkflowContext {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        checkpoint_policy: CheckpointPolicy,
        store: Arc<dyn TaskExecutionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            checkpoint_policy,
            store,
            clock,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 1-indexed attempt number within the current execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        self.checkpoint_policy
    }

    /// Step boundary checkpoint. Written only under `AFTER_EACH_AGENT`.
    pub async fn checkpoint_step(&self, scope: serde_json::Value) -> Result<bool, StoreError> {
        if !self.checkpoint_policy.checkpoints_lifecycle() {
            return Ok(false);
        }
        self.write_checkpoint(scope).await
    }

    /// Root-call checkpoint. Written under `AFTER_EACH_AGENT` and `AFTER_ROOT_CALL`.
    pub async fn checkpoint_scope(&self, scope: serde_json::Value) -> Result<bool, StoreError> {
        if !self.checkpoint_policy.accepts_scope_checkpoints() {
            return Ok(false);
        }
        self.write_checkpoint(scope).await
    }

    /// Latest checkpoint, e.g. to restore scope after a resume.
    pub async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        self.store.load_checkpoint(self.task_id).await
    }

    /// Inputs delivered through `provide_input`, later values win.
    pub async fn provided_inputs(
        &self,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let mut inputs = BTreeMap::new();
        for event in self.store.load_events(self.task_id).await? {
            if let TaskEventKind::InputProvided { key, value } = event.kind {
                inputs.insert(key, value);
            }
        }
        Ok(inputs)
    }

    async fn write_checkpoint(&self, scope: serde_json::Value) -> Result<bool, StoreError> {
        let Some(metadata) = self.store.load_metadata(self.task_id).await? else {
            return Ok(false);
        };
        self.store
            .save_checkpoint(&Checkpoint::taken_at(metadata, Some(scope), self.clock.now()))
            .await?;
        Ok(true)
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("checkpoint_policy", &self.checkpoint_policy)
            .finish_non_exhaustive()
    }
}
