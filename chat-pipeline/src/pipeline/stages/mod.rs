use std::sync::Arc;

use common::{
    error::AppError,
    types::{ChatResponse, MessageRole},
    utils::generation::FragmentStream,
};
use retrieval_pipeline::rank;
use state_machines::core::GuardError;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument};

use super::{
    context::ChatContext,
    prompt::assemble_prompt,
    relay::relay_fragments,
    state::{Buffering, ChatMachine, ContextBuilt, Generating, Received, Streaming, Validated},
};

#[instrument(level = "trace", skip_all, fields(request_id = %ctx.request_id))]
pub fn validate(
    machine: ChatMachine<(), Received>,
    ctx: &mut ChatContext<'_>,
) -> Result<ChatMachine<(), Validated>, AppError> {
    let request = ctx.request;
    let messages = &request.messages;
    if messages.is_empty() {
        return Err(AppError::InvalidRequest(
            "conversation must contain at least one message".into(),
        ));
    }
    if messages.len() > ctx.config.max_messages {
        return Err(AppError::InvalidRequest(format!(
            "conversation has {} messages, the limit is {}",
            messages.len(),
            ctx.config.max_messages
        )));
    }
    if let Some(position) = messages
        .iter()
        .position(|message| message.content.chars().count() > ctx.config.max_message_chars)
    {
        return Err(AppError::InvalidRequest(format!(
            "message {position} exceeds {} characters",
            ctx.config.max_message_chars
        )));
    }

    let query = request
        .latest_user_message()
        .map(|message| message.content.trim())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| {
            AppError::InvalidRequest("conversation needs a non-empty user message".into())
        })?;

    if ctx.filter.is_denied(query) {
        return Err(AppError::InvalidRequest(
            "message contains disallowed content".into(),
        ));
    }

    debug!(
        request_id = %ctx.request_id,
        messages = messages.len(),
        query_chars = query.chars().count(),
        user_turns = messages.iter().filter(|m| m.role == MessageRole::User).count(),
        "chat request validated"
    );
    ctx.query = Some(query.to_string());

    machine
        .validate()
        .map_err(|(_, guard)| map_guard_error("validate", &guard))
}

#[instrument(level = "trace", skip_all, fields(request_id = %ctx.request_id))]
pub async fn build_context(
    machine: ChatMachine<(), Validated>,
    ctx: &mut ChatContext<'_>,
) -> Result<ChatMachine<(), ContextBuilt>, AppError> {
    let query = ctx.query()?;
    let vector = ctx.embedder.embed(query).await?;
    let results = rank(&vector, ctx.corpus, ctx.config.search_limit)?;

    debug!(
        request_id = %ctx.request_id,
        matches = results.len(),
        top_score = results.first().map(|r| r.score),
        "chat context retrieved"
    );

    ctx.quotes = results.into_iter().map(|result| result.entry.text).collect();
    ctx.context_block = ctx.quotes.join("\n");

    machine
        .build_context()
        .map_err(|(_, guard)| map_guard_error("build_context", &guard))
}

#[instrument(level = "trace", skip_all, fields(request_id = %ctx.request_id))]
pub fn start_generation(
    machine: ChatMachine<(), ContextBuilt>,
    ctx: &mut ChatContext<'_>,
) -> Result<ChatMachine<(), Generating>, AppError> {
    ctx.prompt = assemble_prompt(
        &ctx.config.persona,
        &ctx.context_block,
        &ctx.request.messages,
    );
    let deadline = Instant::now()
        .checked_add(ctx.config.generation_timeout)
        .ok_or_else(|| {
            AppError::Config(format!(
                "generation timeout of {:?} overflows the clock",
                ctx.config.generation_timeout
            ))
        })?;
    ctx.deadline = Some(deadline);

    info!(
        request_id = %ctx.request_id,
        provider = ctx.generator.name(),
        model = ctx.generator.model(),
        prompt_messages = ctx.prompt.len(),
        stream = ctx.request.stream,
        "chat generation starting"
    );

    machine
        .start_generation()
        .map_err(|(_, guard)| map_guard_error("start_generation", &guard))
}

#[instrument(level = "trace", skip_all, fields(request_id = %ctx.request_id))]
pub async fn buffer_response(
    machine: ChatMachine<(), Generating>,
    ctx: &mut ChatContext<'_>,
) -> Result<(ChatMachine<(), Buffering>, ChatResponse), AppError> {
    let deadline = ctx.deadline()?;
    let raw = timeout_at(deadline, ctx.generator.generate(&ctx.prompt))
        .await
        .map_err(|_| AppError::ProviderUnavailable("generation provider timed out".into()))??;

    let response = ChatResponse {
        response: ctx.filter.filter(&raw),
        context: std::mem::take(&mut ctx.context_block),
        quotes: std::mem::take(&mut ctx.quotes),
    };

    let machine = machine
        .start_buffering()
        .map_err(|(_, guard)| map_guard_error("start_buffering", &guard))?;
    Ok((machine, response))
}

#[instrument(level = "trace", skip_all, fields(request_id = %ctx.request_id))]
pub async fn open_stream(
    machine: ChatMachine<(), Generating>,
    ctx: &mut ChatContext<'_>,
) -> Result<(ChatMachine<(), Streaming>, FragmentStream), AppError> {
    let deadline = ctx.deadline()?;
    let upstream = timeout_at(deadline, ctx.generator.generate_stream(&ctx.prompt))
        .await
        .map_err(|_| AppError::ProviderUnavailable("generation provider timed out".into()))??;

    let relay = relay_fragments(
        upstream,
        Arc::clone(ctx.filter),
        deadline,
        ctx.request_id.clone(),
    );

    let machine = machine
        .start_streaming()
        .map_err(|(_, guard)| map_guard_error("start_streaming", &guard))?;
    Ok((machine, relay))
}

pub fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid chat pipeline transition during {event}: {guard:?}"
    ))
}
