//! App - アプリケーション層
//!
//! ports を組み合わせて実行エンジンを組み立てる。
//!
//! # 主要コンポーネント
//! - **LongLivedTaskService**: start / resume / cancel / recover のオーケストレータ
//! - **TaskHandle**: 1 回の実行に対応する結果スロット
//! - **ActiveHandles**: プロセス内の実行中タスク表（generation 付き）
//! - **Worker**: リトライループ（1 実行 = 1 tokio タスク）
//! - **Watchdog**: タイムアウトで cancel 経路を呼ぶ
//! - **ServiceConfig**: デフォルト値と環境変数

mod cancel;
pub mod config;
pub mod handle;
pub mod registry;
pub mod service;
mod watchdog;
mod worker;

// 主要な型を再エクスポート
pub use self::config::ServiceConfig;
pub use self::handle::{TaskHandle, TaskResult};
pub use self::registry::ActiveHandles;
pub use self::service::{LongLivedTaskService, RECOVERED_REASON, ServiceBuilder};
