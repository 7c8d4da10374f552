use axum::http::StatusCode;
use serde::Serialize;

use crate::{Error, UpstreamError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    Infra,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// HTTP status, error kind and machine-readable code for a crate error.
pub fn classify(err: &Error) -> (StatusCode, ErrorKind, &'static str) {
    match err {
        Error::Validation(ValidationError::Malformed(_)) => {
            (StatusCode::BAD_REQUEST, ErrorKind::Validation, "invalid_request")
        }
        Error::Validation(ValidationError::UnsupportedMediaType(_)) => (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorKind::Validation,
            "unsupported_media_type",
        ),
        Error::Validation(ValidationError::PayloadTooLarge { .. }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Validation,
            "payload_too_large",
        ),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, ErrorKind::NotFound, "not_found"),
        Error::BindingConflict { .. } => {
            (StatusCode::CONFLICT, ErrorKind::Conflict, "binding_conflict")
        }
        Error::Upstream(UpstreamError::Timeout { .. }) => (
            StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Upstream,
            "upstream_timeout",
        ),
        Error::Upstream(_) => (StatusCode::BAD_GATEWAY, ErrorKind::Upstream, "upstream_failed"),
        Error::Storage(_) | Error::Config(_) | Error::Io(_) | Error::Serialization(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Infra,
            "internal_error",
        ),
    }
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        let (_, kind, code) = classify(err);
        Self::new(kind, code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::malformed("bad"), StatusCode::BAD_REQUEST),
            (
                ValidationError::UnsupportedMediaType("application/pdf".to_string()).into(),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                ValidationError::PayloadTooLarge { size: 2, limit: 1 }.into(),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (
                Error::BindingConflict {
                    temporary_key: "t".to_string(),
                    existing: "a".to_string(),
                    requested: "b".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                UpstreamError::Timeout { provider: "OpenAI" }.into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                UpstreamError::Status {
                    provider: "OpenAI",
                    status: 500,
                    detail: "boom".to_string(),
                }
                .into(),
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Storage("disk".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(classify(&err).0, expected, "{}", err);
        }
    }

    #[test]
    fn test_api_error_serializes_snake_case_kind() {
        let body =
            serde_json::to_value(ApiError::from(&Error::NotFound("gone".to_string()))).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "kind": "not_found",
                "code": "not_found",
                "message": "Not found: gone"
            })
        );
    }
}
