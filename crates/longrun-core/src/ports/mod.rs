//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。エンジン本体（app）はここに並ぶ trait
//! だけに依存し、実装（impls）は差し替え可能。
//!
//! # 設計原則
//! - TaskExecutionStore が source of truth（正本）
//! - Workflow は不透明（エンジンは Outcome しか見ない）
//! - 時刻と ID 生成もテストのために差し替え可能

pub mod clock;
pub mod id_generator;
pub mod task_store;
pub mod workflow;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskExecutionStore;
pub use self::workflow::{Workflow, WorkflowContext};
