//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::engine::Engine;
use crate::config::{ConfigError, EngineConfig};
use crate::ports::{BlobStore, Clock, SystemClock, TaskStore};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(store, blobs)
///     .config(config)
///     .register::<Extract, _>(ExtractHandler)?
///     .expect_functions(&["archives.extract"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_functions() で期待される function 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: TypedRegistry,
    expected_functions: Option<Vec<String>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing functions: {0:?}. These functions were expected but not registered.")]
    MissingFunctions(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            registry: TypedRegistry::new(),
            expected_functions: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される function 名のリストを設定
    pub fn expect_functions(mut self, functions: &[&str]) -> Self {
        self.expected_functions = Some(functions.iter().map(|f| f.to_string()).collect());
        self
    }

    /// # 検証
    /// - 設定値（EngineConfig::validate）
    /// - expect_functions() の function が全て登録されているか
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_functions {
            let missing: Vec<String> = expected
                .iter()
                .filter(|f| !self.registry.contains(f))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingFunctions(missing));
            }
        }

        tracing::debug!(functions = ?self.registry.registered_functions(), "engine built");
        Ok(Engine::new(
            self.store,
            self.blobs,
            self.clock,
            Arc::new(self.registry),
            self.config,
        ))
    }
}
