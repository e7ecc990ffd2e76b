//! Storage module
//!
//! Binary payloads (document attachments, library files) live outside the
//! database behind the [`ObjectStore`] trait. Records only keep the opaque id.

pub mod blob_store;

pub use blob_store::BlobStore;

use crate::config::MAX_FILENAME_LENGTH;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncRead;

/// Readable stream over a stored object
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

/// What the store reports back after a successful put
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Opaque id used for later get and delete calls
    pub id: String,
    pub size: i64,
    /// Hex SHA-256 of the stored bytes
    pub checksum: String,
}

/// External blob storage addressed by opaque ids
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, data: &[u8], name: &str, mime_type: &str) -> Result<StoredObject>;

    async fn get(&self, id: &str) -> Result<ObjectStream>;

    /// Remove an object. Deleting an id that does not exist succeeds.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// `put` bounded by a deadline; an elapsed deadline is a store failure
pub async fn put_within(
    store: &dyn ObjectStore,
    limit: Duration,
    data: &[u8],
    name: &str,
    mime_type: &str,
) -> Result<StoredObject> {
    tokio::time::timeout(limit, store.put(data, name, mime_type))
        .await
        .map_err(|_| AppError::ExternalStore(format!("Upload of {} timed out", name)))?
}

/// `get` bounded by a deadline
pub async fn get_within(store: &dyn ObjectStore, limit: Duration, id: &str) -> Result<ObjectStream> {
    tokio::time::timeout(limit, store.get(id))
        .await
        .map_err(|_| AppError::ExternalStore(format!("Opening object {} timed out", id)))?
}

/// Best-effort removal of objects no record points at any more
pub async fn release(store: &dyn ObjectStore, ids: &[String]) {
    for id in ids {
        if let Err(e) = store.delete(id).await {
            tracing::warn!("Failed to release object {}: {}", id, e);
        }
    }
}

/// Strip path separators and NUL bytes and cap the length of a file name
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0')
        .take(MAX_FILENAME_LENGTH)
        .collect()
}
