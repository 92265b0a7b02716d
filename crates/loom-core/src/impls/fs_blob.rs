//! FsBlobStore - ローカルディスク上の content store
//!
//! Layout: `<root>/<first two hex chars>/<remaining 62 chars>`.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so readers never observe a partially written blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::domain::BlobId;
use crate::ports::{BlobError, BlobStore};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root` as the blob directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: &BlobId) -> PathBuf {
        let (prefix, rest) = id.as_str().split_at(2);
        self.root.join(prefix).join(rest)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId, BlobError> {
        let id = BlobId::of_bytes(&bytes);
        let path = self.path_of(&id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(id);
        }

        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".tmp-{}", Ulid::new()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(blob = %id.short(), size = bytes.len(), "blob stored");
        Ok(id)
    }

    async fn get(&self, id: &BlobId) -> Result<Vec<u8>, BlobError> {
        match tokio::fs::read(self.path_of(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, BlobError> {
        Ok(tokio::fs::try_exists(self.path_of(id)).await?)
    }
}
