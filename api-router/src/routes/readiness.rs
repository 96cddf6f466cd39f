use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::utils::generation::HealthStatus;
use serde_json::json;

use crate::api_state::ApiState;

/// Readiness probe: returns 200 if the corpus is loaded and generation is reachable, else 503.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    let corpus_ready = !state.pipeline.corpus().is_empty();
    let generation = state.pipeline.generator().health_check().await;
    let generation_ready = generation.status != HealthStatus::Down;

    let checks = json!({
        "corpus": if corpus_ready { "ok" } else { "fail" },
        "generation": if generation_ready { "ok" } else { "fail" },
    });

    if corpus_ready && generation_ready {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "checks": checks
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checks": checks,
                "reason": generation.error.unwrap_or_else(|| "corpus is empty".to_string())
            })),
        )
    }
}
