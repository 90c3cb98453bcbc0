//! Filesystem blob store
//!
//! Blobs are plain files under a base directory, one file per path.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use sealbox_core::{BlobStore, StoreError};

use super::validate_path;

/// Configuration for the filesystem blob store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsBlobStoreConfig {
    /// Base directory for blob storage
    pub base_dir: PathBuf,
    /// Maximum blob size (bytes)
    pub max_blob_size: u64,
}

impl Default for FsBlobStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/blobs"),
            max_blob_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

/// Blob store backed by the local filesystem
#[derive(Debug)]
pub struct FsBlobStore {
    config: FsBlobStoreConfig,
}

impl FsBlobStore {
    /// Create a new blob store, creating the base directory if needed
    pub async fn new(config: FsBlobStoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.base_dir).await?;

        info!(path = %config.base_dir.display(), "Blob store initialized");

        Ok(Self { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &FsBlobStoreConfig {
        &self.config
    }

    /// Map a validated blob path onto the filesystem
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.config.base_dir.clone(), |acc, segment| acc.join(segment)))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Bytes, StoreError> {
        let file_path = self.resolve(path)?;

        match fs::read(&file_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> Result<u64, StoreError> {
        if data.len() as u64 > self.config.max_blob_size {
            return Err(StoreError::CapacityExceeded);
        }

        let file_path = self.resolve(path)?;

        // Ensure parent directory exists
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically (write to temp, then rename)
        let temp_path = file_path.with_file_name(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));

        let mut file = File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &file_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!("Stored blob");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let file_path = self.resolve(path)?;

        match fs::remove_file(&file_path).await {
            Ok(()) => {
                debug!("Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let file_path = self.resolve(path)?;
        Ok(fs::try_exists(&file_path).await?)
    }
}
