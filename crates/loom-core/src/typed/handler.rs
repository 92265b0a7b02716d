//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::decode_args;
use super::context::TaskContext;
use super::task::Task;
use crate::domain::{Arg, BlobId, TaskError};

/// Handler は Task を実行して結果 blob（任意）を返す
///
/// # 使用例
/// ```ignore
/// struct ExtractHandler;
///
/// #[async_trait]
/// impl Handler<Extract> for ExtractHandler {
///     async fn handle(&self, task: Extract, ctx: &mut TaskContext)
///         -> Result<Option<BlobId>, TaskError>
///     {
///         let bytes = ctx.read_blob(&task.archive).await?;
///         ...
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<Extract>` は `Extract` しか受け取れない
/// - コンパイル時に Task と Handler の対応が保証される
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: &mut TaskContext) -> Result<Option<BlobId>, TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T, H> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        args: &[Arg],
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError>;

    fn function(&self) -> &'static str;

    fn broken_reasons(&self) -> &'static [&'static str];
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        args: &[Arg],
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let task: T = decode_args(args)?;
        self.handler.handle(task, ctx).await
    }

    fn function(&self) -> &'static str {
        T::FUNCTION
    }

    fn broken_reasons(&self) -> &'static [&'static str] {
        T::BROKEN_REASONS
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{Digest, Echo};

    /// Stores the text as a blob.
    pub struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(
            &self,
            task: Echo,
            ctx: &mut TaskContext,
        ) -> Result<Option<BlobId>, TaskError> {
            ctx.log(format!("echo {}", task.text));
            Ok(Some(ctx.put_blob(task.text.into_bytes()).await?))
        }
    }

    /// Hashes the input `rounds` times; empty input is broken.
    pub struct DigestHandler;

    #[async_trait]
    impl Handler<Digest> for DigestHandler {
        async fn handle(
            &self,
            task: Digest,
            ctx: &mut TaskContext,
        ) -> Result<Option<BlobId>, TaskError> {
            let mut bytes = ctx.read_blob(&task.input).await?;
            if bytes.is_empty() {
                return Err(TaskError::broken("empty_input", "nothing to digest"));
            }
            for _ in 0..task.rounds {
                bytes = blake3::hash(&bytes).as_bytes().to_vec();
            }
            Ok(Some(ctx.put_blob(bytes).await?))
        }
    }
}
