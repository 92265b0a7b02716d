//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//! - **LibSqlTaskStore**: libsql（SQLite 互換）による永続化された正本
//! - **InMemoryBlobStore** / **FsBlobStore**: content store

pub mod fs_blob;
pub mod inmem_blob;
pub mod inmem_store;
pub mod libsql_store;
pub mod schema;

// 主要な型を再エクスポート
pub use self::fs_blob::FsBlobStore;
pub use self::inmem_blob::InMemoryBlobStore;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::libsql_store::LibSqlTaskStore;
