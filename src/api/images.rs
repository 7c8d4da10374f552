use axum::body::Bytes;
use axum::extract::multipart::Field;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::error::ErrorKind;
use crate::api::parse_json;
use crate::api::response::{error_failure, failure, success, ApiJson, ApiResult};
use crate::api::server::AppState;
use crate::image::{ImageReference, ImageSource, IngestRequest};
use crate::{Error, Result, ValidationError};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    #[serde(default, alias = "image_url")]
    image_url: Option<String>,
    #[serde(default, alias = "image_base64")]
    image_base64: Option<String>,
    #[serde(default, alias = "temporary_key")]
    temporary_key: Option<String>,
}

/// `POST /images`: multipart (`image` or `file` part, optional `temporaryKey`)
/// or JSON `{imageUrl | imageBase64, temporaryKey?}`.
pub async fn upload_image_handler(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<ImageReference> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let max_bytes = state.app.ingestor().max_bytes();

    let ingest = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|rejection| rejection_failure(rejection.status(), rejection.body_text()))?;
        read_multipart(multipart, max_bytes).await
    } else {
        let body = Bytes::from_request(request, &state)
            .await
            .map_err(|rejection| rejection_failure(rejection.status(), rejection.body_text()))?;
        parse_json::<UploadBody>(&body).and_then(json_source)
    };
    let ingest = ingest.map_err(|e| error_failure(&e))?;

    let reference = state
        .app
        .ingestor()
        .ingest(ingest)
        .await
        .map_err(|e| error_failure(&e))?;
    Ok(success(reference))
}

fn rejection_failure(status: StatusCode, message: String) -> ApiJson<Value> {
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "invalid_request"
    };
    warn!(code, "image upload rejected: {}", message);
    failure(status, ErrorKind::Validation, code, message)
}

fn json_source(body: UploadBody) -> Result<IngestRequest> {
    let source = match (body.image_url, body.image_base64) {
        (Some(url), None) => ImageSource::Url(url),
        (None, Some(payload)) => ImageSource::Base64(payload),
        (Some(_), Some(_)) => {
            return Err(Error::malformed(
                "provide either imageUrl or imageBase64, not both",
            ))
        }
        (None, None) => return Err(Error::malformed("imageUrl or imageBase64 is required")),
    };

    Ok(IngestRequest {
        source,
        temporary_key: body.temporary_key,
    })
}

async fn read_multipart(mut multipart: Multipart, max_bytes: usize) -> Result<IngestRequest> {
    let mut source = None;
    let mut temporary_key = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name().unwrap_or_default() {
            "image" | "file" => {
                let declared_mime = field.content_type().map(str::to_string);
                let data = read_field(field, max_bytes).await?;
                debug!(
                    "Received multipart image ({} bytes, declared {})",
                    data.len(),
                    declared_mime.as_deref().unwrap_or("nothing")
                );
                source = Some(ImageSource::Bytes {
                    data,
                    declared_mime,
                });
            }
            "imageUrl" | "image_url" => {
                source = Some(ImageSource::Url(field.text().await.map_err(multipart_error)?));
            }
            "temporaryKey" | "temporary_key" => {
                let key = field.text().await.map_err(multipart_error)?;
                let key = key.trim();
                if !key.is_empty() {
                    temporary_key = Some(key.to_string());
                }
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let source =
        source.ok_or_else(|| Error::malformed("multipart body has no image or file part"))?;
    Ok(IngestRequest {
        source,
        temporary_key,
    })
}

/// Read a file part, stopping as soon as it exceeds the ingestion limit.
async fn read_field(mut field: Field<'_>, max_bytes: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        data.extend_from_slice(&chunk);
        if data.len() > max_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: data.len(),
                limit: max_bytes,
            }
            .into());
        }
    }
    Ok(data)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> Error {
    Error::malformed(format!("invalid multipart body: {}", err.body_text()))
}
