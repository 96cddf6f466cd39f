use std::sync::Arc;

use anyhow::Context;
use api_router::{api_routes_v1, api_state::ApiState};
use axum::{extract::Request, Router};
use chat_pipeline::{ChatConfig, ChatPipeline};
use common::utils::{
    config::{get_config, AppConfig},
    content_filter::ContentFilter,
    embedding::{Embedder, EmbeddingProvider},
    generation::provider_from_config,
};
use retrieval_pipeline::{default_corpus_texts, load_corpus_texts, Corpus};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let state = build_state(&config).await?;
    let app = app(state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Runs every startup step once. Nothing is initialised lazily per request.
async fn build_state(config: &AppConfig) -> anyhow::Result<ApiState> {
    let embedding_provider = Arc::new(EmbeddingProvider::from_config(config).await?);
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_model = ?embedding_provider.model_code(),
        embedding_dimension = embedding_provider.dimension(),
        "Embedding provider initialized"
    );

    let texts = match &config.corpus_path {
        Some(path) => load_corpus_texts(path)
            .await
            .with_context(|| format!("loading corpus from {path}"))?,
        None => default_corpus_texts(),
    };
    if texts.is_empty() {
        warn!("Corpus is empty; chat answers will carry no reference lines");
    }
    let corpus = Corpus::embed_texts(texts, embedding_provider.as_ref())
        .await
        .context("embedding corpus")?;

    let filter = ContentFilter::new(&config.denylist, config.redaction_marker.clone())
        .context("building content filter")?;

    let generator = provider_from_config(config).context("building generation provider")?;
    info!(
        generation_backend = generator.name(),
        generation_model = generator.model(),
        "Generation provider initialized"
    );

    let pipeline = ChatPipeline::new(
        Arc::new(corpus),
        embedding_provider as Arc<dyn Embedder>,
        generator,
        Arc::new(filter),
        ChatConfig::from(config),
    );

    Ok(ApiState::new(config, Arc::new(pipeline)))
}

fn app(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes_v1(&state))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %Uuid::new_v4(),
            )
        }))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
