use crate::health;
use crate::jobs::{GenerationRequest, JobKind, Provider};
use crate::logging::request_id_middleware;
use crate::main_helper::UpstreamSettings;
use crate::predictions::PredictionHandle;
use crate::redaction::redact_value;
use crate::relay::upstream_stream;
use crate::types::{ArtsparkError, RelayError, Result};
use crate::AppState;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub const NDJSON_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/generate/:kind", post(generate_by_kind))
        .route("/api/generate-portrait", post(generate_portrait))
        .route("/api/generate-animal-landmark", post(generate_animal_landmark))
        .route("/api/generate-timemachine", post(generate_timemachine))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness));

    if let Some(dir) = &state.args.static_dir {
        tracing::info!("Serving front-end assets from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    app.layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(cors)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn generate_by_kind(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let kind: JobKind = kind.parse()?;
    relay_job(state, kind, body).await
}

async fn generate_portrait(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    relay_job(state, JobKind::Portrait, body).await
}

async fn generate_animal_landmark(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    relay_job(state, JobKind::AnimalLandmark, body).await
}

async fn generate_timemachine(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    relay_job(state, JobKind::AgeTransform, body).await
}

/// Validate, resolve credentials, fail over to a live upstream, then hand the
/// job to a relay or prediction task. Everything before that can still be
/// rejected with a JSON error; after it the response is committed to 200.
#[tracing::instrument(name = "relay.job", skip_all, fields(kind = %kind))]
async fn relay_job(
    state: Arc<AppState>,
    kind: JobKind,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let Json(body) = body.map_err(|e| ArtsparkError::Validation(e.body_text()))?;
    let request = GenerationRequest::from_json(kind, body)?;

    let settings = UpstreamSettings::from_env(&state.args, kind.provider())?;
    let endpoints = kind.endpoints(settings.override_url.as_deref())?;
    let upstream_body = request.upstream_body();

    if tracing::enabled!(tracing::Level::DEBUG) {
        let mut logged = upstream_body.clone();
        redact_value(&mut logged);
        tracing::debug!("[🖥️  -> ⚙️ ] Upstream request: {}", logged);
    }

    let response = state
        .failover
        .send(&endpoints, &upstream_body, &settings.api_key)
        .await?;

    match kind.provider() {
        Provider::Grsai => Ok(ndjson_response(state.relay.spawn(upstream_stream(response)))),
        Provider::Replicate => {
            let handle = PredictionHandle::from_response(response).await?;
            let stream = state.predictions.spawn(handle, settings.api_key);
            Ok(ndjson_response(stream))
        }
    }
}

/// 200 response streaming one JSON object per line. An `Err` item aborts the body.
pub fn ndjson_response<S>(stream: S) -> Response
where
    S: Stream<Item = std::result::Result<Bytes, RelayError>> + Send + 'static,
{
    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
