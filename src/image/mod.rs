//! Image ingestion
//!
//! Validates uploaded images (bytes, `data:` URLs or remote URLs), strips
//! metadata, persists them to the blob store and records them in the
//! session store under a temporary key.

pub mod data_url;
pub mod mime;

use crate::session::{validate_session_key, ImageContext, ImagePayload, SessionLifecycle};
use crate::{Error, Result, ValidationError};
use little_exif::metadata::Metadata;
use serde::Serialize;
use std::io::Write as _;
use std::sync::Arc;
use tokio_retry::{strategy::FixedInterval, Retry};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub enum ImageSource {
    Bytes {
        data: Vec<u8>,
        declared_mime: Option<String>,
    },
    /// `http(s)` URL, `data:` URL, or bare base64.
    Url(String),
    Base64(String),
}

pub struct IngestRequest {
    pub source: ImageSource,
    pub temporary_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub temporary_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Set when the temporary key was already bound to a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_bytes: usize,
    pub strip_metadata: bool,
}

pub struct ImageIngestor {
    lifecycle: Arc<SessionLifecycle>,
    limits: IngestLimits,
}

impl ImageIngestor {
    pub fn new(lifecycle: Arc<SessionLifecycle>, limits: IngestLimits) -> Self {
        Self { lifecycle, limits }
    }

    pub fn max_bytes(&self) -> usize {
        self.limits.max_bytes
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<ImageReference> {
        let temporary_key = match request.temporary_key {
            Some(key) => {
                validate_session_key(&key)?;
                key
            }
            None => format!("tmp-{}", Uuid::new_v4().simple()),
        };

        let context = match request.source {
            ImageSource::Bytes {
                data,
                declared_mime,
            } => {
                self.inline_context(&temporary_key, data, declared_mime.as_deref())
                    .await?
            }
            ImageSource::Url(url) if data_url::is_data_url(&url) => {
                let decoded = data_url::parse_data_url(&url)?;
                self.inline_context(&temporary_key, decoded.data, decoded.declared_mime.as_deref())
                    .await?
            }
            ImageSource::Url(url) => remote_context(&temporary_key, &url)?,
            ImageSource::Base64(payload) => {
                self.check_size(payload.len() / 4 * 3)?;
                let data = data_url::decode_base64(&payload)?;
                self.inline_context(&temporary_key, data, None).await?
            }
        };

        let mime_type = context.payload.mime_type().map(str::to_string);
        let size = context.payload.size();
        let public_url = context.public_url.clone();

        let store = self.lifecycle.store();
        if let Some(replaced) = store.put(&temporary_key, context) {
            debug!("Replacing image context for {}", replaced.session_key);
            self.lifecycle.release(replaced).await;
        }

        let resolved = store.resolve(&temporary_key);
        let durable_key = (resolved != temporary_key).then_some(resolved);

        info!(
            "Stored image for {} ({}, {} bytes){}",
            temporary_key,
            mime_type.as_deref().unwrap_or("unknown type"),
            size.map_or_else(|| "remote".to_string(), |s| s.to_string()),
            durable_key
                .as_ref()
                .map(|d| format!(", bound to {}", d))
                .unwrap_or_default()
        );

        Ok(ImageReference {
            temporary_key,
            public_url,
            durable_key,
            mime_type,
            size,
        })
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.limits.max_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: self.limits.max_bytes,
            }
            .into());
        }
        Ok(())
    }

    async fn inline_context(
        &self,
        key: &str,
        data: Vec<u8>,
        declared_mime: Option<&str>,
    ) -> Result<ImageContext> {
        if data.is_empty() {
            return Err(Error::malformed("image payload is empty"));
        }
        self.check_size(data.len())?;

        let mime_type = resolve_mime(&data, declared_mime)?;

        let data = if self.limits.strip_metadata {
            strip_metadata(data, mime_type).await
        } else {
            data
        };
        let data: Arc<[u8]> = Arc::from(data);

        let blob_key = format!("{}.{}", Uuid::new_v4(), mime::extension_for(mime_type));
        let public_url = self.persist(&blob_key, Arc::clone(&data), mime_type).await?;

        Ok(ImageContext::new(
            key,
            ImagePayload::Inline {
                data,
                mime_type: mime_type.to_string(),
            },
        )
        .with_blob(blob_key, public_url))
    }

    async fn persist(
        &self,
        blob_key: &str,
        data: Arc<[u8]>,
        mime_type: &'static str,
    ) -> Result<Option<String>> {
        let retry_strategy = FixedInterval::from_millis(200).take(2);
        let blobs = Arc::clone(self.lifecycle.blobs());

        Retry::spawn(retry_strategy, || {
            let blobs = Arc::clone(&blobs);
            let data = Arc::clone(&data);
            let blob_key = blob_key.to_string();
            async move {
                blobs
                    .store(&blob_key, &data, mime_type)
                    .await
                    .inspect_err(|e| warn!("Blob store attempt for {} failed: {}", blob_key, e))
            }
        })
        .await
    }
}

/// The sniffed format wins over whatever the client declared.
fn resolve_mime(data: &[u8], declared_mime: Option<&str>) -> Result<&'static str> {
    if let Some(sniffed) = mime::detect_image_mime(data) {
        if let Some(declared) = declared_mime {
            if mime::normalize(declared) != sniffed {
                debug!(
                    "Declared MIME type {} differs from detected {}",
                    declared, sniffed
                );
            }
        }
        return Ok(sniffed);
    }

    let reason = match declared_mime {
        Some(declared) if !mime::is_supported(declared) => declared.to_string(),
        _ => "unrecognized image data".to_string(),
    };
    Err(ValidationError::UnsupportedMediaType(reason).into())
}

fn remote_context(key: &str, raw_url: &str) -> Result<ImageContext> {
    let url = url::Url::parse(raw_url)
        .map_err(|e| Error::malformed(format!("invalid imageUrl: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::malformed(format!(
            "unsupported imageUrl scheme '{}'",
            url.scheme()
        )));
    }

    Ok(ImageContext::new(
        key,
        ImagePayload::Remote {
            mime_type: mime::mime_from_path(url.path()).map(str::to_string),
            url: url.into(),
        },
    ))
}

/// Remove EXIF and similar metadata; on failure the original bytes are kept.
async fn strip_metadata(data: Vec<u8>, mime_type: &'static str) -> Vec<u8> {
    if mime_type == "image/gif" {
        return data;
    }

    let extension = mime::extension_for(mime_type);
    let original = data.clone();
    match tokio::task::spawn_blocking(move || clear_metadata_sync(&data, extension)).await {
        Ok(Ok(stripped)) if mime::detect_image_mime(&stripped) == Some(mime_type) => stripped,
        Ok(Ok(_)) => {
            warn!("Metadata stripping produced unreadable output, keeping original");
            original
        }
        Ok(Err(e)) => {
            debug!("Metadata not stripped: {}", e);
            original
        }
        Err(e) => {
            warn!("Metadata stripping task failed: {}", e);
            original
        }
    }
}

fn clear_metadata_sync(data: &[u8], extension: &str) -> std::result::Result<Vec<u8>, String> {
    let mut file = tempfile::Builder::new()
        .suffix(&format!(".{}", extension))
        .tempfile()
        .map_err(|e| e.to_string())?;
    file.write_all(data).map_err(|e| e.to_string())?;
    file.flush().map_err(|e| e.to_string())?;

    Metadata::file_clear_metadata(file.path()).map_err(|e| e.to_string())?;

    std::fs::read(file.path()).map_err(|e| e.to_string())
}
