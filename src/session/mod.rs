//! Session-scoped image context
//!
//! Holds the image a user uploaded for a voice conversation until it has
//! been injected into a forwarded completion, and cleans it up when the
//! conversation ends or goes stale.

pub mod lifecycle;
pub mod store;

pub use lifecycle::SessionLifecycle;
pub use store::{BindOutcome, Consumed, SessionStore};

use crate::models::ImageReferenceMode;
use crate::{Error, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Image bytes held in memory, or a URL the provider can resolve itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    Inline { data: Arc<[u8]>, mime_type: String },
    Remote { url: String, mime_type: Option<String> },
}

impl ImagePayload {
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            ImagePayload::Inline { mime_type, .. } => Some(mime_type),
            ImagePayload::Remote { mime_type, .. } => mime_type.as_deref(),
        }
    }

    pub fn size(&self) -> Option<usize> {
        match self {
            ImagePayload::Inline { data, .. } => Some(data.len()),
            ImagePayload::Remote { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageContext {
    pub session_key: String,
    pub payload: ImagePayload,
    /// Key of the backing blob, released on eviction.
    pub blob_key: Option<String>,
    pub public_url: Option<String>,
    pub injected: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl ImageContext {
    pub fn new(session_key: impl Into<String>, payload: ImagePayload) -> Self {
        let now = Utc::now();
        Self {
            session_key: session_key.into(),
            payload,
            blob_key: None,
            public_url: None,
            injected: false,
            created_at: now,
            last_accessed_at: now,
        }
    }

    pub fn with_blob(mut self, blob_key: String, public_url: Option<String>) -> Self {
        self.blob_key = Some(blob_key);
        self.public_url = public_url;
        self
    }

    /// URL placed in the injected `image_url` part.
    pub fn reference_url(&self, mode: ImageReferenceMode) -> String {
        if mode == ImageReferenceMode::PublicUrl {
            if let Some(url) = &self.public_url {
                return url.clone();
            }
        }

        match &self.payload {
            ImagePayload::Inline { data, mime_type } => format!(
                "data:{};base64,{}",
                mime_type,
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
            ImagePayload::Remote { url, .. } => url.clone(),
        }
    }
}

/// A temporary upload key bound to the platform's conversation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub temporary_key: String,
    pub durable_key: String,
}

const MAX_SESSION_KEY_LEN: usize = 128;

/// Keys are opaque to the store but must be short, printable identifiers.
pub fn validate_session_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::malformed("session key must not be empty"));
    }
    if key.len() > MAX_SESSION_KEY_LEN {
        return Err(Error::malformed(format!(
            "session key exceeds {} characters",
            MAX_SESSION_KEY_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(Error::malformed(format!("invalid session key '{}'", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_key() {
        assert!(validate_session_key("tmp-1").is_ok());
        assert!(validate_session_key("conv_01HZX:abc.def").is_ok());
        assert!(validate_session_key("").is_err());
        assert!(validate_session_key("has space").is_err());
        assert!(validate_session_key(&"a".repeat(129)).is_err());
    }

    fn inline_context() -> ImageContext {
        ImageContext::new(
            "tmp-1",
            ImagePayload::Inline {
                data: Arc::from(&b"\x89PNG"[..]),
                mime_type: "image/png".to_string(),
            },
        )
    }

    #[test]
    fn test_inline_reference_is_data_url() {
        let url = inline_context().reference_url(ImageReferenceMode::Inline);
        assert_eq!(url, "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_public_url_mode_prefers_public_url() {
        let context = inline_context().with_blob(
            "abc.png".to_string(),
            Some("https://proxy.example.com/files/abc.png".to_string()),
        );
        assert_eq!(
            context.reference_url(ImageReferenceMode::PublicUrl),
            "https://proxy.example.com/files/abc.png"
        );
    }

    #[test]
    fn test_public_url_mode_falls_back_to_inline() {
        let url = inline_context().reference_url(ImageReferenceMode::PublicUrl);
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_remote_reference_is_passed_through() {
        let context = ImageContext::new(
            "tmp-2",
            ImagePayload::Remote {
                url: "https://images.example.com/cat.jpg".to_string(),
                mime_type: Some("image/jpeg".to_string()),
            },
        );
        assert_eq!(
            context.reference_url(ImageReferenceMode::Inline),
            "https://images.example.com/cat.jpg"
        );
        assert_eq!(context.payload.size(), None);
    }
}
