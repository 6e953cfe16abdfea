//! Impls - `TaskExecutionStore` の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 揮発性（テスト・単一プロセス用）
//! - **FileTaskStore**: タスクごとのディレクトリに JSON で永続化（プロセス間でも CAS が atomic）

pub mod file_store;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::file_store::{FileStoreConfig, FileTaskStore};
pub use self::memory_store::InMemoryTaskStore;
