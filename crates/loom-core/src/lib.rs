//! loom-core
//!
//! Persisted task graph engine: content-addressed task records with named
//! dependency edges, an exclusive claim protocol, a broken/error failure
//! taxonomy with operator retry, liveness reclamation, and progress/ETA
//! estimation from recent throughput.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, task, outcome）
//! - **queue**: 依存関係の判定とリトライ/回収ポリシー（ストレージ非依存）
//! - **ports**: 抽象化レイヤー（TaskStore, BlobStore, Clock）
//! - **impls**: 実装（in-memory, libsql, ファイルシステム blob）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, TaskContext）
//! - **app**: アプリケーションロジック（builder, engine, resolver, runtime, worker_loop, など）
//! - **config**: TOML 設定
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{Engine, EngineBuilder, StatsSnapshot};
pub use config::EngineConfig;
pub use error::LoomError;
