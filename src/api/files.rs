use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::api::response::error_failure;
use crate::api::server::AppState;
use crate::blob::is_valid_blob_key;
use crate::Error;

/// `GET /files/{key}`: serve a stored image so providers can fetch it by URL.
pub async fn file_handler(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    if !is_valid_blob_key(&key) {
        return error_failure(&Error::NotFound(format!("file '{}'", key))).into_response();
    }

    match state.app.blobs().fetch(&key).await {
        Ok(Some(blob)) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, blob.content_type),
                (CACHE_CONTROL, "private, max-age=300".to_string()),
            ],
            blob.data,
        )
            .into_response(),
        Ok(None) => error_failure(&Error::NotFound(format!("file '{}'", key))).into_response(),
        Err(e) => error_failure(&e).into_response(),
    }
}
