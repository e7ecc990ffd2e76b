//! On-disk object store
//!
//! Each object gets a random UUID id and is stored in a two-level directory
//! structure next to a small JSON sidecar with its original name and type.
//!
//! Example: id "abcd1234..." is stored at "blobs/ab/cd/abcd1234..."

use super::{ObjectStore, ObjectStream, StoredObject};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Sidecar written beside every object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub checksum: String,
    pub stored_at: DateTime<Utc>,
}

/// Object store backed by a local directory
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a new blob store at the given root directory
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Initialize the blob store (create directory if needed)
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        tracing::info!("Blob store initialized at: {:?}", self.root);
        Ok(())
    }

    /// Read the sidecar of an object
    pub async fn metadata(&self, id: &str) -> Result<ObjectMetadata> {
        let path = self.object_path(id)?.with_extension("json");

        let content = fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::ExternalStore(format!("Object not found: {}", id)),
            _ => AppError::ExternalStore(format!("Failed to read metadata of {}: {}", id, e)),
        })?;

        Ok(serde_json::from_str(&content)?)
    }

    pub async fn exists(&self, id: &str) -> bool {
        match self.object_path(id) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Get blob store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for an id; rejects anything that is not a simple UUID
    fn object_path(&self, id: &str) -> Result<PathBuf> {
        if id.len() != 32 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::ExternalStore(format!("Invalid object id: {}", id)));
        }

        Ok(self.root.join(&id[0..2]).join(&id[2..4]).join(id))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(temp_path, path).await
    }

    async fn remove_if_present(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ObjectStore for BlobStore {
    async fn put(&self, data: &[u8], name: &str, mime_type: &str) -> Result<StoredObject> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self.object_path(&id)?;
        let checksum = calculate_hash(data);
        let size = i64::try_from(data.len())
            .map_err(|_| AppError::ExternalStore("Object too large".to_string()))?;

        let metadata = ObjectMetadata {
            original_name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            checksum: checksum.clone(),
            stored_at: Utc::now(),
        };
        let sidecar = serde_json::to_vec_pretty(&metadata)?;

        let write = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            Self::write_atomic(&path, data).await?;
            Self::write_atomic(&path.with_extension("json"), &sidecar).await
        };

        write
            .await
            .map_err(|e| AppError::ExternalStore(format!("Failed to store {}: {}", name, e)))?;

        tracing::debug!("Stored object: {} ({} bytes, {})", id, size, mime_type);

        Ok(StoredObject { id, size, checksum })
    }

    async fn get(&self, id: &str) -> Result<ObjectStream> {
        let path = self.object_path(id)?;

        let file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::ExternalStore(format!("Object not found: {}", id)),
            _ => AppError::ExternalStore(format!("Failed to open {}: {}", id, e)),
        })?;

        tracing::debug!("Opened object: {}", id);
        Ok(Box::new(file))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.object_path(id)?;

        Self::remove_if_present(&path)
            .await
            .and(Self::remove_if_present(&path.with_extension("json")).await)
            .map_err(|e| AppError::ExternalStore(format!("Failed to delete {}: {}", id, e)))?;

        tracing::debug!("Deleted object: {}", id);
        Ok(())
    }
}
