//! BlobStore port - content-addressed storage for immutable payloads.
//!
//! Blobs are identified by the hash of their bytes and never change after
//! `put`. Tasks reference them as arguments and results.

use async_trait::async_trait;

use crate::domain::BlobId;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(BlobId),

    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes; returns their hash. Storing the same bytes twice is a no-op.
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId, BlobError>;

    async fn get(&self, id: &BlobId) -> Result<Vec<u8>, BlobError>;

    async fn exists(&self, id: &BlobId) -> Result<bool, BlobError>;
}
