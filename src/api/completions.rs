use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::api::error::classify;
use crate::api::server::AppState;
use crate::proxy::{CompletionProxy, ErrorEnvelope, RelayEvent};
use crate::Error;

/// OpenAI-compatible `POST /chat/completions`.
///
/// Errors use the OpenAI `{"error": {...}}` body so voice platforms surface
/// them like any other provider failure.
pub async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let app = &state.app;
    let header_key = headers
        .get(app.config().session_header.as_str())
        .and_then(|value| value.to_str().ok());

    let request = match CompletionProxy::parse(&body) {
        Ok(request) => request,
        Err(e) => return openai_error(&e),
    };

    let turn = match app.proxy().prepare(header_key, request) {
        Ok(turn) => turn,
        Err(e) => return openai_error(&e),
    };

    debug!(
        "Forwarding {} message(s), stream={}, session={}",
        turn.request.messages.len(),
        turn.request.is_stream(),
        turn.session
            .as_ref()
            .map(|s| s.key.as_str())
            .unwrap_or("none")
    );

    if turn.request.is_stream() {
        let events = app
            .proxy()
            .stream(turn)
            .map(|event| Ok::<_, Infallible>(sse_event(event)));
        return Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    match app.proxy().complete(turn).await {
        Ok(completion) => (StatusCode::OK, Json(completion)).into_response(),
        Err(e) => openai_error(&e),
    }
}

fn openai_error(err: &Error) -> Response {
    let (status, _, code) = classify(err);
    if status.is_server_error() {
        error!(code, "chat completion failed: {}", err);
    } else {
        warn!(code, "chat completion rejected: {}", err);
    }
    (status, Json(ErrorEnvelope::from(err))).into_response()
}

fn sse_event(event: RelayEvent) -> Event {
    match event {
        RelayEvent::Chunk(chunk) => json_event(&chunk),
        RelayEvent::Error(body) => json_event(&body),
        RelayEvent::Done => Event::default().data("[DONE]"),
    }
}

fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            warn!("Failed to encode stream event: {}", e);
            Event::default().data(
                r#"{"error":{"message":"failed to encode stream event","type":"server_error","code":"internal_error"}}"#,
            )
        }
    }
}

