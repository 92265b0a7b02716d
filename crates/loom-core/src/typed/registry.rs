//! TypedRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

/// TypedRegistry は型付き Handler を関数名で登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<Extract, _>(ExtractHandler)?;
///
/// let handler = registry.resolve("archives.extract")?;
/// ```
///
/// 起動時に構築し（mutable）、実行時は共有して読むだけ（immutable）。
#[derive(Default, Clone)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for function '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no handler registered for function '{0}'")]
    UnknownFunction(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let function = T::FUNCTION.to_string();
        if self.handlers.contains_key(&function) {
            return Err(RegistryError::AlreadyRegistered(function));
        }
        self.handlers
            .insert(function, Arc::new(TypedHandler::<T, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, function: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(function).cloned()
    }

    /// Like `get`, failing closed for unknown names.
    pub fn resolve(&self, function: &str) -> Result<Arc<dyn DynHandler>, RegistryError> {
        self.get(function)
            .ok_or_else(|| RegistryError::UnknownFunction(function.to_string()))
    }

    pub fn contains(&self, function: &str) -> bool {
        self.handlers.contains_key(function)
    }

    /// Registered function names, sorted.
    pub fn registered_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
