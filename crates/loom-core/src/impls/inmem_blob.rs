//! InMemoryBlobStore - テスト用の content store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::BlobId;
use crate::ports::{BlobError, BlobStore};

/// Blobs kept in a hash map keyed by their digest.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobId, Arc<Vec<u8>>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId, BlobError> {
        let id = BlobId::of_bytes(&bytes);
        self.blobs
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(bytes));
        Ok(id)
    }

    async fn get(&self, id: &BlobId) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(id)
            .map(|bytes| bytes.as_ref().clone())
            .ok_or_else(|| BlobError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, BlobError> {
        Ok(self.blobs.read().await.contains_key(id))
    }
}
