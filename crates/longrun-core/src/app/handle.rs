//! TaskHandle - 呼び出し側から見た 1 回の実行
//!
//! # 設計
//! - 結果スロットは `watch` チャネル（`None` → `Some(result)` の一度きり）
//! - 書き込み側（`ResultSlot`）は worker・registry・cancel 経路で共有し、最初の settle だけが勝つ
//! - 状態は store から読む（ハンドル自身は状態を持たない）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::app::cancel::cancel_task;
use crate::app::registry::ActiveHandles;
use crate::domain::{StoreError, TaskError, TaskId, TaskMetadata, TaskStatus};
use crate::ports::{Clock, TaskExecutionStore};

/// Final value of an execution.
pub type TaskResult = Result<serde_json::Value, TaskError>;

/// Write side of a handle's result slot.
#[derive(Clone)]
pub(crate) struct ResultSlot {
    tx: Arc<watch::Sender<Option<TaskResult>>>,
}

impl ResultSlot {
    /// First settle wins; later calls return false and change nothing.
    pub(crate) fn settle(&self, result: TaskResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }
}

/// Proxy for one execution of a task. A fresh handle is minted by every
/// `start` and `resume`; the previous one settles as `Superseded`.
///
/// # 使用例
/// ```ignore
/// let handle = service.start(config, workflow).await?;
/// match handle.await_result(Duration::from_secs(60)).await {
///     Ok(value) => println!("done: {value}"),
///     Err(TaskError::Paused(signal)) => println!("waiting for {:?}", signal.input_key),
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    result: watch::Receiver<Option<TaskResult>>,
    store: Arc<dyn TaskExecutionStore>,
    registry: ActiveHandles,
    clock: Arc<dyn Clock>,
}

impl TaskHandle {
    pub(crate) fn new(
        task_id: TaskId,
        store: Arc<dyn TaskExecutionStore>,
        registry: ActiveHandles,
        clock: Arc<dyn Clock>,
    ) -> (Self, ResultSlot) {
        let (tx, rx) = watch::channel(None);
        let handle = Self {
            task_id,
            result: rx,
            store,
            registry,
            clock,
        };
        (handle, ResultSlot { tx: Arc::new(tx) })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Persisted status (the store is authoritative, not the handle).
    pub async fn status(&self) -> Result<Option<TaskStatus>, StoreError> {
        Ok(self
            .store
            .load_metadata(self.task_id)
            .await?
            .map(|m| m.status()))
    }

    pub async fn metadata(&self) -> Result<Option<TaskMetadata>, StoreError> {
        self.store.load_metadata(self.task_id).await
    }

    pub fn is_settled(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// The result if already settled, without waiting.
    pub fn try_result(&self) -> Option<TaskResult> {
        self.result.borrow().clone()
    }

    /// Waits until the execution settles.
    pub async fn result(&self) -> TaskResult {
        let mut rx = self.result.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => match &*slot {
                Some(result) => result.clone(),
                None => Err(self.abandoned()),
            },
            // 全ての書き込み側が settle せずに消えた（abort など）
            Err(_) => Err(self.abandoned()),
        }
    }

    /// Like [`TaskHandle::result`], giving up after `timeout`.
    pub async fn await_result(&self, timeout: Duration) -> TaskResult {
        tokio::time::timeout(timeout, self.result())
            .await
            .unwrap_or(Err(TaskError::AwaitTimeout(timeout)))
    }

    /// Same cancellation path as `LongLivedTaskService::cancel`.
    pub async fn cancel(&self) -> Result<bool, StoreError> {
        cancel_task(
            self.store.as_ref(),
            &self.registry,
            self.clock.as_ref(),
            self.task_id,
        ).await
    }

    fn abandoned(&self) -> TaskError {
        TaskError::Aborted {
            task_id: self.task_id,
            reason: "execution ended without a result".to_string(),
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
