use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{completions, files, images, sessions};
use crate::app::App;

// Leaves room for base64 inflation and multipart framing around a maximal image.
const MIN_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub app: Arc<App>,
}

impl AppState {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME"),
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            app,
        }
    }
}

pub fn build_router(app: Arc<App>) -> Router {
    let body_limit = app
        .config()
        .max_image_bytes
        .saturating_mul(2)
        .max(MIN_BODY_LIMIT);
    let state = AppState::new(app);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(
            "/chat/completions",
            post(completions::chat_completions_handler),
        )
        .route(
            "/v1/chat/completions",
            post(completions::chat_completions_handler),
        )
        .route("/images", post(images::upload_image_handler))
        .route("/sessions/associate", post(sessions::associate_handler))
        .route("/sessions/end", post(sessions::end_session_handler))
        .route("/files/{key}", get(files::file_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, letting in-flight requests finish.
pub async fn serve(
    addr: SocketAddr,
    app: Arc<App>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn root_handler(State(state): State<AppState>) -> String {
    format!("{} {} is running", state.service_name, state.service_version)
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let service = state.app.proxy().service();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "provider": service.provider(),
            "model": service.model(),
            "sessions": state.app.store().len(),
            "started_unix_ms": state.started_unix_ms,
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
