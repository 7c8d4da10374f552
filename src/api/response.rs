use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::api::error::{classify, ApiError, ErrorKind};
use crate::Error;

/// `{ok, ...payload}` on success, `{ok: false, error}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiEnvelope<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

pub type ApiJson<T> = (StatusCode, Json<ApiEnvelope<T>>);

pub type ApiResult<T> = std::result::Result<ApiJson<T>, ApiJson<Value>>;

pub fn success<T>(payload: T) -> ApiJson<T>
where
    T: Serialize,
{
    (
        StatusCode::OK,
        Json(ApiEnvelope {
            ok: true,
            data: Some(payload),
            error: None,
        }),
    )
}

pub fn failure(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiJson<Value> {
    (
        status,
        Json(ApiEnvelope {
            ok: false,
            data: None,
            error: Some(ApiError::new(kind, code, message)),
        }),
    )
}

pub fn error_failure(err: &Error) -> ApiJson<Value> {
    let (status, kind, code) = classify(err);
    if status.is_server_error() {
        error!(code, "request failed: {}", err);
    } else {
        warn!(code, "request rejected: {}", err);
    }
    failure(status, kind, code, err.to_string())
}
