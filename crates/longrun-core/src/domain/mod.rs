//! Domain model (ids, status, metadata, policies, outcomes, events, errors).
//!
//! このモジュールは永続化やスケジューリングを知らない。
//! 「何を記録するか」の形だけを定義する。

pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod ids;
pub mod metadata;
pub mod outcome;
pub mod retry;
pub mod spec;
pub mod state;

pub use checkpoint::Checkpoint;
pub use errors::{ConfigError, ServiceError, StoreError, TaskError};
pub use events::{TaskEvent, TaskEventKind};
pub use ids::{ParseTaskIdError, TaskId};
pub use metadata::{TaskContext, TaskMetadata};
pub use outcome::{FailureKind, Outcome, PauseSignal, WorkflowFailure};
pub use retry::{Backoff, RetryPolicy};
pub use spec::{CheckpointPolicy, ParseCheckpointPolicyError, TaskConfiguration};
pub use state::{ParseTaskStatusError, TaskStatus};
