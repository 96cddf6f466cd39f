use std::{pin::Pin, time::Duration};

use async_stream::stream;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream},
        IntoResponse, Response, Sse,
    },
    Json,
};
use chat_pipeline::ChatOutcome;
use common::{error::AppError, types::ChatRequest, utils::generation::FragmentStream};
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::{api_state::ApiState, error::ApiError};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

/// Answers a conversation as one JSON body or as server-sent fragments.
pub async fn chat(
    State(state): State<ApiState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    match state.pipeline.handle(request).await? {
        ChatOutcome::Buffered(response) => Ok(Json(response).into_response()),
        ChatOutcome::Streaming(fragments) => Ok(fragment_events(fragments).into_response()),
    }
}

fn fragment_events(mut fragments: FragmentStream) -> Sse<KeepAliveStream<EventStream>> {
    let events = stream! {
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => yield Event::default().json_data(&fragment),
                Err(err) => {
                    warn!(kind = err.kind(), error = %err, "chat stream ended with an error");
                    yield Ok(Event::default().event("error").data(stream_error_message(&err)));
                    break;
                }
            }
        }
    };

    Sse::new(events.boxed()).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn stream_error_message(err: &AppError) -> &'static str {
    match err {
        AppError::ProviderUnavailable(_) => "The generation service is unavailable",
        _ => "Generation failed",
    }
}
