use super::{is_valid_blob_key, BlobStore, StoredBlob};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Stores blobs as files in one directory, served back by this service.
pub struct LocalBlobStore {
    dir: PathBuf,
    public_base_url: Option<String>,
}

impl LocalBlobStore {
    pub async fn new(dir: impl AsRef<Path>, public_base_url: Option<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!("Local blob store at {}", dir.display());

        Ok(Self {
            dir,
            public_base_url,
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_blob_key(key) {
            return Err(Error::Storage(format!("Invalid blob key: {}", key)));
        }
        Ok(self.dir.join(key))
    }

    fn get_public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{}/files/{}", base, key))
    }
}

fn content_type_for(key: &str) -> String {
    Path::new(key)
        .extension()
        .and_then(image::ImageFormat::from_extension)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, key: &str, data: &[u8], _content_type: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        tokio::fs::write(&path, data).await?;
        tracing::debug!("Stored blob {} ({} bytes)", key, data.len());
        Ok(self.get_public_url(key))
    }

    async fn fetch(&self, key: &str) -> Result<Option<StoredBlob>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(StoredBlob {
                data,
                content_type: content_type_for(key),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Removed blob {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
