//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてエンジンの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング（fail-fast 検証）
//! - **Engine**: 投入・再実行・統計・ワーカー起動の入口
//! - **Resolver**: 依存関係の定期スイープ
//! - **Runtime**: 実行ラッパー（heartbeat, panic 捕捉, 結果の報告）
//! - **WorkerLoop**: タスク実行ループ（sweep→claim→execute）
//! - **ReaperLoop**: 生存確認切れタスクの回収
//! - **StatsLoop / Status**: 進捗と ETA の見積もり

pub mod builder;
pub mod engine;
pub mod reaper_loop;
pub mod resolver;
pub mod runtime;
pub mod stats_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::{Engine, EngineHandle};
pub use self::reaper_loop::ReaperLoop;
pub use self::resolver::{Resolver, SweepReport};
pub use self::runtime::{Execution, ExecutionLimits, Runtime};
pub use self::stats_loop::StatsLoop;
pub use self::status::{FunctionStats, StatsSnapshot, format_eta};
pub use self::worker_loop::{StepOutcome, Worker, WorkerGroup};
