use axum::body::Bytes;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::parse_json;
use crate::api::response::{error_failure, success, ApiResult};
use crate::api::server::AppState;
use crate::session::validate_session_key;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociateRequest {
    #[serde(alias = "temporary_key")]
    temporary_key: String,
    #[serde(alias = "durable_key")]
    durable_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociateResponse {
    pub temporary_key: String,
    pub durable_key: String,
    pub already_bound: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndRequest {
    #[serde(default, alias = "durable_key")]
    durable_key: Option<String>,
    #[serde(default, alias = "temporary_key")]
    temporary_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndResponse {
    pub durable_key: String,
    pub evicted: bool,
}

/// `POST /sessions/associate`: bind an upload's temporary key to the
/// platform's conversation id.
///
/// With no upload behind the temporary key yet, the binding is kept and the
/// call answers `NotFound`; a later upload under that key lands in the
/// session directly.
pub async fn associate_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<AssociateResponse> {
    associate(&state, &body)
        .await
        .map(success)
        .map_err(|e| error_failure(&e))
}

async fn associate(state: &AppState, body: &[u8]) -> Result<AssociateResponse> {
    let request: AssociateRequest = parse_json(body)?;
    validate_session_key(&request.temporary_key)?;
    validate_session_key(&request.durable_key)?;

    let lifecycle = state.app.lifecycle();
    let outcome = lifecycle
        .store()
        .bind(&request.temporary_key, &request.durable_key)?;

    if let Some(replaced) = outcome.replaced {
        info!(
            "Session {} already had an image, replacing it",
            request.durable_key
        );
        lifecycle.release(replaced).await;
    }

    if !outcome.has_context {
        return Err(Error::NotFound(format!(
            "no image uploaded for temporary key '{}'",
            request.temporary_key
        )));
    }

    if outcome.newly_bound {
        info!(
            "Bound temporary key {} to session {}",
            request.temporary_key, request.durable_key
        );
    }

    Ok(AssociateResponse {
        temporary_key: request.temporary_key,
        durable_key: request.durable_key,
        already_bound: !outcome.newly_bound,
    })
}

/// `POST /sessions/end`: evict the session's image context.
pub async fn end_session_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<EndResponse> {
    end_session(&state, &body)
        .await
        .map(success)
        .map_err(|e| error_failure(&e))
}

async fn end_session(state: &AppState, body: &[u8]) -> Result<EndResponse> {
    let request: EndRequest = parse_json(body)?;
    let key = request
        .durable_key
        .or(request.temporary_key)
        .ok_or_else(|| Error::malformed("durableKey is required"))?;
    validate_session_key(&key)?;

    let evicted = state.app.lifecycle().end_session(&key).await;
    Ok(EndResponse {
        durable_key: key,
        evicted,
    })
}
