use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

pub async fn search(
    State(state): State<ApiState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = payload?;
    let limit = request
        .limit
        .unwrap_or(state.pipeline.config().search_limit);

    let results = state.pipeline.search(&request.query, limit).await?;

    Ok(Json(SearchResponse {
        results: results
            .into_iter()
            .map(|ranked| SearchHit {
                id: ranked.entry.id,
                text: ranked.entry.text,
                score: ranked.score,
            })
            .collect(),
    }))
}
