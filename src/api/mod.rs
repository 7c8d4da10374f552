//! HTTP surface
//!
//! Chat completions in the OpenAI wire shape, plus the image upload, session
//! association and file routes the voice front end calls.

pub mod completions;
pub mod error;
pub mod files;
pub mod images;
pub mod response;
pub mod server;
pub mod sessions;

pub use server::{build_router, serve, AppState};

use crate::{Error, Result};
use serde::de::DeserializeOwned;

/// Decode a JSON request body, reporting shape errors as validation failures.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Err(Error::malformed("request body is empty"));
    }
    serde_json::from_slice(body).map_err(|e| Error::malformed(format!("invalid JSON body: {}", e)))
}
