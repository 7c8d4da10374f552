//! Backing storage for uploaded image payloads
//!
//! Stored blobs can be served back by reference (`GET /files/{key}`) so a
//! provider is able to fetch an image by URL, and are deleted when their
//! session is evicted.

pub mod local;
pub mod mock;
pub mod s3;

pub use local::LocalBlobStore;
pub use mock::MockBlobStore;
pub use s3::S3BlobStore;

use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `data` under `key`, returning its public URL when one exists.
    async fn store(&self, key: &str, data: &[u8], content_type: &str) -> Result<Option<String>>;
    async fn fetch(&self, key: &str) -> Result<Option<StoredBlob>>;
    /// Delete `key`; deleting a missing blob is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Keys are generated by the service, so anything else is rejected outright.
pub fn is_valid_blob_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
