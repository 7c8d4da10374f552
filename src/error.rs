//! Error handling and custom error types
//!
//! Provides unified error handling across the service using thiserror.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Binding conflict: temporary key '{temporary_key}' is already bound to '{existing}' (requested '{requested}')"
    )]
    BindingConflict {
        temporary_key: String,
        existing: String,
        requested: String,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Blob storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Input rejected before it reaches any upstream provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Malformed(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Failure of a call to the upstream model provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("{provider} API error (status {status}): {detail}")]
    Status {
        provider: &'static str,
        status: u16,
        detail: String,
    },

    #[error("{provider} request timed out")]
    Timeout { provider: &'static str },

    #[error("Failed to parse {provider} response: {detail}")]
    Malformed {
        provider: &'static str,
        detail: String,
    },

    #[error("Failed to reach {provider}: {detail}")]
    Transport {
        provider: &'static str,
        detail: String,
    },
}

impl UpstreamError {
    pub fn from_reqwest(provider: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { provider }
        } else if err.is_decode() {
            Self::Malformed {
                provider,
                detail: err.to_string(),
            }
        } else {
            Self::Transport {
                provider,
                detail: err.to_string(),
            }
        }
    }

    /// Upstream HTTP status when the provider answered with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::Malformed(message.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
