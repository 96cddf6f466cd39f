mod config;
mod context;
mod prompt;
mod relay;
mod stages;
mod state;

pub use config::ChatConfig;
pub use prompt::assemble_prompt;

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    types::{ChatRequest, ChatResponse},
    utils::{
        content_filter::ContentFilter,
        embedding::Embedder,
        generation::{FragmentStream, GenerationProvider},
    },
};
use retrieval_pipeline::{rank, Corpus, RankedResult};
use tracing::{debug, info};

use self::{
    context::ChatContext,
    stages::{buffer_response, build_context, map_guard_error, open_stream, start_generation, validate},
    state::received,
};

/// What a chat request produced, depending on its `stream` flag.
pub enum ChatOutcome {
    Buffered(ChatResponse),
    Streaming(FragmentStream),
}

impl fmt::Debug for ChatOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(response) => f.debug_tuple("Buffered").field(response).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Retrieval-augmented chat over a fixed corpus.
///
/// Holds only shared, read-only collaborators, so one instance serves every request.
#[allow(clippy::module_name_repetitions)]
pub struct ChatPipeline {
    corpus: Arc<Corpus>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn GenerationProvider>,
    filter: Arc<ContentFilter>,
    config: ChatConfig,
}

impl ChatPipeline {
    pub fn new(
        corpus: Arc<Corpus>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn GenerationProvider>,
        filter: Arc<ContentFilter>,
        config: ChatConfig,
    ) -> Self {
        Self {
            corpus,
            embedder,
            generator,
            filter,
            config,
        }
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    pub fn generator(&self) -> &Arc<dyn GenerationProvider> {
        &self.generator
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Buffered entry point; ignores the request's `stream` flag.
    pub async fn respond(&self, mut request: ChatRequest) -> Result<ChatResponse, AppError> {
        request.stream = false;
        match self.handle(request).await? {
            ChatOutcome::Buffered(response) => Ok(response),
            ChatOutcome::Streaming(_) => Err(AppError::InternalError(
                "buffered request produced a stream".into(),
            )),
        }
    }

    /// Streaming entry point; ignores the request's `stream` flag.
    pub async fn respond_stream(&self, mut request: ChatRequest) -> Result<FragmentStream, AppError> {
        request.stream = true;
        match self.handle(request).await? {
            ChatOutcome::Streaming(stream) => Ok(stream),
            ChatOutcome::Buffered(_) => Err(AppError::InternalError(
                "streaming request produced a buffered response".into(),
            )),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(messages = request.messages.len(), stream = request.stream)
    )]
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatOutcome, AppError> {
        let mut ctx = ChatContext::new(
            &request,
            &self.config,
            self.corpus.as_ref(),
            self.embedder.as_ref(),
            self.generator.as_ref(),
            &self.filter,
        );
        let pipeline_started = Instant::now();

        let machine = received();
        let machine = validate(machine, &mut ctx).map_err(|err| ctx.abort(err))?;

        let stage_start = Instant::now();
        let machine = build_context(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let retrieve_ms = Self::duration_millis(stage_start.elapsed());

        let machine = start_generation(machine, &mut ctx).map_err(|err| ctx.abort(err))?;

        let stage_start = Instant::now();
        let outcome = if request.stream {
            let (machine, stream) = open_stream(machine, &mut ctx)
                .await
                .map_err(|err| ctx.abort(err))?;
            let _machine = machine
                .finish()
                .map_err(|(_, guard)| ctx.abort(map_guard_error("finish", &guard)))?;
            ChatOutcome::Streaming(stream)
        } else {
            let (machine, response) = buffer_response(machine, &mut ctx)
                .await
                .map_err(|err| ctx.abort(err))?;
            let _machine = machine
                .finish()
                .map_err(|(_, guard)| ctx.abort(map_guard_error("finish", &guard)))?;
            ChatOutcome::Buffered(response)
        };
        let generate_ms = Self::duration_millis(stage_start.elapsed());

        info!(
            request_id = %ctx.request_id,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            retrieve_ms,
            generate_ms,
            stream = request.stream,
            "chat pipeline finished"
        );

        Ok(outcome)
    }

    /// Ranks the corpus against free text, outside of any conversation.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedResult>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidRequest("search query must not be empty".into()));
        }
        if query.chars().count() > self.config.max_message_chars {
            return Err(AppError::InvalidRequest(format!(
                "search query exceeds {} characters",
                self.config.max_message_chars
            )));
        }

        let vector = self.embedder.embed(query).await?;
        let results = rank(&vector, &self.corpus, limit)?;
        debug!(limit, matches = results.len(), "corpus search finished");
        Ok(results)
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests;
