//! Worker - 1 回の実行（execution）を最後まで運ぶ tokio タスク
//!
//! # フロー
//! 1. workflow を呼ぶ（cancel シグナルと select で競合）
//! 2. Outcome に応じて CAS
//!    - Completed: RUNNING → COMPLETED
//!    - Paused:    RUNNING → PAUSED（リトライしない）
//!    - Failed:    リトライ可能なら RUNNING → RETRYING → (backoff) → RUNNING、
//!                 そうでなければ RUNNING → FAILED
//! 3. CAS に勝ったときだけイベント・チェックポイント・結果を書く
//! 4. 自分の generation のエントリだけを registry から外す
//!
//! CAS に負けた（ほぼ cancel との競合）場合は store の状態を読み直して
//! ハンドルを settle するだけで、他には何も書かない。

use std::sync::Arc;

use tokio::sync::{oneshot, watch};

use crate::app::handle::ResultSlot;
use crate::app::registry::ActiveHandles;
use crate::domain::{
    Checkpoint, CheckpointPolicy, Outcome, PauseSignal, RetryPolicy, StoreError, TaskError,
    TaskEvent, TaskEventKind, TaskId, TaskMetadata, TaskStatus, WorkflowFailure,
};
use crate::ports::{Clock, TaskExecutionStore, Workflow, WorkflowContext};

pub(crate) struct Execution {
    pub(crate) task_id: TaskId,
    pub(crate) generation: u64,
    pub(crate) workflow: Arc<dyn Workflow>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) checkpoint_policy: CheckpointPolicy,
    pub(crate) store: Arc<dyn TaskExecutionStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: ActiveHandles,
    pub(crate) slot: ResultSlot,
    pub(crate) cancel_rx: watch::Receiver<bool>,

    /// Dropped when the execution ends; stops its watchdog.
    pub(crate) _done: Option<oneshot::Sender<()>>,
}

/// Where the attempt loop stopped.
enum Step {
    Retry,
    Done,
}

impl Execution {
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.drive().await {
            tracing::error!(task_id = %self.task_id, error = %e, "execution aborted by storage error");
            self.slot.settle(Err(TaskError::Aborted {
                task_id: self.task_id,
                reason: e.to_string(),
            }));
        }
        self.registry
            .remove_if_current(self.task_id, self.generation)
            .await;
    }

    async fn drive(&mut self) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            let ctx = WorkflowContext::new(
                self.task_id,
                attempt,
                self.checkpoint_policy,
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
            );
            tracing::debug!(task_id = %self.task_id, attempt, "invoking workflow");

            // cancel されたら workflow の future は次の await で drop される
            let outcome = tokio::select! {
                _ = cancelled(&mut self.cancel_rx) => None,
                outcome = self.workflow.run(ctx) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                return self.settle_lost_race().await;
            };

            match outcome {
                Outcome::Completed(value) => return self.complete(value).await,
                Outcome::Paused(signal) => return self.pause(signal).await,
                Outcome::Failed(failure) => {
                    let retries_left = attempt <= self.retry_policy.max_retries;
                    if !(retries_left && self.retry_policy.is_retryable(&failure)) {
                        return self.fail(failure).await;
                    }
                    match self.retry(attempt, &failure).await? {
                        Step::Retry => attempt += 1,
                        Step::Done => return Ok(()),
                    }
                }
            }
        }
    }

    async fn complete(&self, value: serde_json::Value) -> Result<(), StoreError> {
        if self
            .cas(TaskStatus::Running, TaskStatus::Completed, None)
            .await?
            .is_none()
        {
            return self.settle_lost_race().await;
        }

        self.append(TaskEventKind::Completed {
            result: value.to_string(),
        })
        .await?;
        tracing::info!(task_id = %self.task_id, "task completed");
        self.slot.settle(Ok(value));
        Ok(())
    }

    async fn pause(&self, signal: PauseSignal) -> Result<(), StoreError> {
        let Some(metadata) = self
            .cas(TaskStatus::Running, TaskStatus::Paused, None)
            .await?
        else {
            return self.settle_lost_race().await;
        };

        self.append(TaskEventKind::Paused {
            reason: signal.reason.clone(),
            input_key: signal.input_key.clone(),
        })
        .await?;
        self.lifecycle_checkpoint(metadata).await?;
        tracing::info!(
            task_id = %self.task_id,
            reason = %signal.reason,
            input_key = ?signal.input_key,
            "task paused"
        );
        self.slot.settle(Err(TaskError::Paused(signal)));
        Ok(())
    }

    async fn fail(&self, failure: WorkflowFailure) -> Result<(), StoreError> {
        let reason = failure.message.clone();
        if self
            .cas(TaskStatus::Running, TaskStatus::Failed, Some(&reason))
            .await?
            .is_none()
        {
            return self.settle_lost_race().await;
        }

        self.append(TaskEventKind::Failed {
            reason: reason.clone(),
        })
        .await?;
        tracing::error!(task_id = %self.task_id, kind = %failure.kind, %reason, "task failed");
        self.slot.settle(Err(TaskError::Failed(failure)));
        Ok(())
    }

    async fn retry(&mut self, attempt: u32, failure: &WorkflowFailure) -> Result<Step, StoreError> {
        let delay = self.retry_policy.delay_for_attempt(attempt);

        let Some(metadata) = self
            .cas(TaskStatus::Running, TaskStatus::Retrying, None)
            .await?
        else {
            self.settle_lost_race().await?;
            return Ok(Step::Done);
        };

        self.append(TaskEventKind::Retried {
            attempt,
            max_retries: self.retry_policy.max_retries,
            error: failure.message.clone(),
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        })
        .await?;
        self.lifecycle_checkpoint(metadata).await?;
        tracing::warn!(
            task_id = %self.task_id,
            attempt,
            max_retries = self.retry_policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "attempt failed, retrying"
        );

        let interrupted = tokio::select! {
            _ = cancelled(&mut self.cancel_rx) => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if interrupted {
            self.settle_lost_race().await?;
            return Ok(Step::Done);
        }

        if self
            .cas(TaskStatus::Retrying, TaskStatus::Running, None)
            .await?
            .is_none()
        {
            self.settle_lost_race().await?;
            return Ok(Step::Done);
        }
        Ok(Step::Retry)
    }

    /// Engine checkpoint at pause/retry. Keeps any scope the workflow stored.
    async fn lifecycle_checkpoint(&self, metadata: TaskMetadata) -> Result<(), StoreError> {
        if !self.checkpoint_policy.checkpoints_lifecycle() {
            return Ok(());
        }
        let scope = self
            .store
            .load_checkpoint(self.task_id)
            .await?
            .and_then(|previous| previous.scope);
        self.store
            .save_checkpoint(&Checkpoint::taken_at(metadata, scope, self.clock.now()))
            .await
    }

    /// Someone else moved the status first. Settle from what the store says.
    async fn settle_lost_race(&self) -> Result<(), StoreError> {
        let status = self
            .store
            .load_metadata(self.task_id)
            .await?
            .map(|m| m.status());
        tracing::debug!(task_id = %self.task_id, status = ?status, "lost status race");

        let result = match status {
            Some(TaskStatus::Cancelled) => Err(TaskError::Cancelled(self.task_id)),
            Some(other) => Err(TaskError::Aborted {
                task_id: self.task_id,
                reason: format!("status moved to {other} concurrently"),
            }),
            None => Err(TaskError::Aborted {
                task_id: self.task_id,
                reason: "task record disappeared".to_string(),
            }),
        };
        self.slot.settle(result);
        Ok(())
    }

    async fn cas(
        &self,
        expected: TaskStatus,
        target: TaskStatus,
        reason: Option<&str>,
    ) -> Result<Option<TaskMetadata>, StoreError> {
        self.store
            .compare_and_set_status(self.task_id, expected, target, reason)
            .await
    }

    async fn append(&self, kind: TaskEventKind) -> Result<(), StoreError> {
        self.store
            .append_event(&TaskEvent::at(self.task_id, kind, self.clock.now()))
            .await
    }
}

/// Resolves once the cancel flag is raised. Never resolves if the sender
/// goes away without raising it.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
