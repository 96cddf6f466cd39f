use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::utils::generation::{HealthStatus, ProviderHealth};
use serde_json::json;

use crate::api_state::ApiState;

/// Detailed health report. Always 200; problems are reported as status fields.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let generation = state.pipeline.generator().health_check().await;
    let corpus_size = state.pipeline.corpus().len();

    (
        StatusCode::OK,
        Json(json!({
            "status": overall_status(corpus_size, &generation),
            "corpus_size": corpus_size,
            "generation": generation,
            "uptime_secs": state.started_at.elapsed().as_secs(),
        })),
    )
}

fn overall_status(corpus_size: usize, generation: &ProviderHealth) -> &'static str {
    match generation.status {
        HealthStatus::Down => "unhealthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Up if corpus_size == 0 => "degraded",
        HealthStatus::Up => "healthy",
    }
}
