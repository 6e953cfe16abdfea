//! longrun-core
//!
//! Durable, resumable execution of long-lived tasks.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, metadata, retry, spec, outcome, events, checkpoint, errors）
//! - **ports**: 抽象化レイヤー（TaskExecutionStore, Workflow, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（service, handle, registry, worker, watchdog, config）
//! - **impls**: store 実装（InMemoryTaskStore, FileTaskStore）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{LongLivedTaskService, ServiceConfig, TaskHandle, TaskResult};
pub use domain::{
    Backoff, Checkpoint, CheckpointPolicy, ConfigError, FailureKind, Outcome, PauseSignal,
    RetryPolicy, ServiceError, StoreError, TaskConfiguration, TaskError, TaskEvent, TaskEventKind,
    TaskId, TaskMetadata, TaskStatus, WorkflowFailure,
};
pub use impls::{FileStoreConfig, FileTaskStore, InMemoryTaskStore};
pub use ports::{TaskExecutionStore, Workflow, WorkflowContext};
