use std::sync::Arc;

use common::{
    error::AppError,
    types::{ChatMessage, ChatRequest},
    utils::{content_filter::ContentFilter, embedding::Embedder, generation::GenerationProvider},
};
use retrieval_pipeline::Corpus;
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

use super::config::ChatConfig;

pub struct ChatContext<'a> {
    pub request_id: String,
    pub request: &'a ChatRequest,
    pub config: &'a ChatConfig,
    pub corpus: &'a Corpus,
    pub embedder: &'a dyn Embedder,
    pub generator: &'a dyn GenerationProvider,
    pub filter: &'a Arc<ContentFilter>,
    pub query: Option<String>,
    pub quotes: Vec<String>,
    pub context_block: String,
    pub prompt: Vec<ChatMessage>,
    pub deadline: Option<Instant>,
}

impl<'a> ChatContext<'a> {
    pub fn new(
        request: &'a ChatRequest,
        config: &'a ChatConfig,
        corpus: &'a Corpus,
        embedder: &'a dyn Embedder,
        generator: &'a dyn GenerationProvider,
        filter: &'a Arc<ContentFilter>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            request,
            config,
            corpus,
            embedder,
            generator,
            filter,
            query: None,
            quotes: Vec::new(),
            context_block: String::new(),
            prompt: Vec::new(),
            deadline: None,
        }
    }

    pub fn query(&self) -> Result<&str, AppError> {
        self.query
            .as_deref()
            .ok_or_else(|| AppError::InternalError("validated query expected to be available".into()))
    }

    pub fn deadline(&self) -> Result<Instant, AppError> {
        self.deadline.ok_or_else(|| {
            AppError::InternalError("generation deadline expected to be set".into())
        })
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        if matches!(err, AppError::InvalidRequest(_)) {
            warn!(
                request_id = %self.request_id,
                error = %err,
                "chat request rejected"
            );
        } else {
            error!(
                request_id = %self.request_id,
                kind = err.kind(),
                error = %err,
                "chat pipeline aborted"
            );
        }
        err
    }
}
