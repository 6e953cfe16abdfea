//! Timeout watchdog
//!
//! 実行ごとに 1 つ。期限が来たら通常の cancel 経路を呼ぶだけ。
//! 実行が先に終わると `done` が閉じて、watchdog は何もせずに消える。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::app::cancel::cancel_task;
use crate::app::registry::ActiveHandles;
use crate::domain::TaskId;
use crate::ports::{Clock, TaskExecutionStore};

pub(crate) fn spawn(
    store: Arc<dyn TaskExecutionStore>,
    registry: ActiveHandles,
    clock: Arc<dyn Clock>,
    task_id: TaskId,
    generation: u64,
    timeout: Duration,
    done: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = done => return,
            _ = tokio::time::sleep(timeout) => {}
        }

        // resume で別の実行に置き換わっていたら触らない
        if !registry.is_current(task_id, generation).await {
            return;
        }

        match cancel_task(store.as_ref(), &registry, clock.as_ref(), task_id).await {
            Ok(true) => {
                tracing::warn!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "task timed out, cancelled");
            }
            Ok(false) => {
                tracing::debug!(task_id = %task_id, "timeout fired after task settled");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "failed to cancel timed-out task");
            }
        }
    })
}
