//! Errors - エラー型と分類
//!
//! - `StoreError`: 永続化の失敗（その操作にとって致命的、store 内ではリトライしない）
//! - `ServiceError`: 呼び出し側の操作が現在の状態と合わない、または store 失敗
//! - `TaskError`: TaskHandle の結果が失敗で確定したときの理由
//! - `ConfigError`: 環境変数の値が不正
//!
//! CAS の競合負けはエラーではない（`Option` / `bool` で表現する）。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::ids::TaskId;
use super::outcome::{PauseSignal, WorkflowFailure};
use super::state::TaskStatus;

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode/decode {what} for {task_id}: {source}")]
    Serde {
        what: &'static str,
        task_id: TaskId,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("storage worker failed: {0}")]
    Background(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error returned synchronously by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The operation is not legal for the task's persisted status.
    #[error("{message}")]
    IllegalState {
        task_id: TaskId,
        status: TaskStatus,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub(crate) fn illegal_state(
        task_id: TaskId,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> Self {
        ServiceError::IllegalState {
            task_id,
            status,
            message: message.into(),
        }
    }

    /// Status named by an `IllegalState` error.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            ServiceError::IllegalState { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a task handle settled without a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(WorkflowFailure),

    #[error("task is waiting for input ({})", .0.reason)]
    Paused(PauseSignal),

    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("task {0} was resumed; use the new handle")]
    Superseded(TaskId),

    #[error("no result within {0:?}")]
    AwaitTimeout(Duration),

    /// The worker stopped without reaching a recorded outcome
    /// (storage failure, service shutdown).
    #[error("task {task_id} aborted: {reason}")]
    Aborted { task_id: TaskId, reason: String },
}

/// An environment variable held a value the config could not use.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(var: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            var,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
