use crate::jobs::Provider;
use crate::main_helper::UpstreamSettings;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    /// Draw API key (portrait, animal-landmark).
    pub api_key: String,
    /// Prediction API token (age-transform).
    pub prediction_token: String,
    pub endpoint_override: bool,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready only when every provider has a credential.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let check = |provider| match UpstreamSettings::from_env(&state.args, provider) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::error!("Readiness check: {}", e.inner);
            None
        }
    };
    let draw = check(Provider::Grsai);
    let prediction = check(Provider::Replicate);
    let label = |s: &Option<UpstreamSettings>| {
        let label = if s.is_some() { "ok" } else { "missing" };
        label.to_string()
    };

    let ready = draw.is_some() && prediction.is_some();
    let endpoint_override = [&draw, &prediction]
        .into_iter()
        .flatten()
        .any(|s| s.override_url.is_some());
    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unready")
    };
    (
        code,
        Json(ReadinessResponse {
            status: status.to_string(),
            api_key: label(&draw),
            prediction_token: label(&prediction),
            endpoint_override,
        }),
    )
}
