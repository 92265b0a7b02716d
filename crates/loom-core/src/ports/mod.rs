//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（libsql, ファイルシステム上の blob 置き場など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! - TaskStore がタスク状態と依存関係の正本
//! - BlobStore は不変のバイト列（content-addressed）の保存先
//! - Clock はテストで時間を固定するための差し替え口

pub mod blob_store;
pub mod clock;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::blob_store::{BlobError, BlobStore};
pub use self::clock::{Clock, FixedClock, SystemClock, earlier};
pub use self::task_store::{
    Candidates, ErrorTypeCount, RecentRow, Reported, StatsRows, StatusCount, StoreError,
    Submitted, TaskFilter, TaskStore,
};
