use thiserror::Error;

use crate::app::builder::BuildError;
use crate::config::ConfigError;
use crate::ports::{BlobError, StoreError};
use crate::typed::RegistryError;

#[derive(Debug, Error)]
pub enum LoomError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("stored stats snapshot is unreadable: {0}")]
    Snapshot(#[from] serde_json::Error),
}
