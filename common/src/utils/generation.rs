use std::{
    pin::Pin,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_openai::{
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{classify_reqwest_error, AppError},
    types::{ChatFragment, ChatMessage, MessageRole},
    utils::config::AppConfig,
};

/// Lazy, finite, non-restartable sequence of generated fragments.
///
/// Dropping the stream drops the underlying HTTP response and frees the connection.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<ChatFragment, AppError>> + Send>>;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_DEGRADED_AFTER: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

/// Reachability report for a generation backend. Probes never fail; problems are data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProviderHealth {
    fn from_probe(provider: &str, elapsed: Duration, error: Option<String>) -> Self {
        let status = if error.is_some() || elapsed > HEALTH_DEGRADED_AFTER {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
        Self {
            provider: provider.to_string(),
            status,
            response_time_ms: Some(duration_millis(elapsed)),
            error,
        }
    }

    fn down(provider: &str, error: String) -> Self {
        Self {
            provider: provider.to_string(),
            status: HealthStatus::Down,
            response_time_ms: None,
            error: Some(error),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The only text-generation capability the chat pipeline depends on.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Short backend label for logs and health output.
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Produces the whole response as one block.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AppError>;

    /// Opens an incremental response. Connection failures surface here, before any
    /// fragment is produced; failures after that arrive as stream items.
    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, AppError>;

    async fn health_check(&self) -> ProviderHealth;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationBackend {
    Ollama,
    OpenAI,
}

impl FromStr for GenerationBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            other => Err(AppError::Config(format!(
                "unknown generation backend '{other}'. Expected 'ollama' or 'openai'."
            ))),
        }
    }
}

/// Builds the generation backend selected by `generation_backend`.
pub fn provider_from_config(config: &AppConfig) -> Result<Arc<dyn GenerationProvider>, AppError> {
    match GenerationBackend::from_str(&config.generation_backend)? {
        GenerationBackend::Ollama => Ok(Arc::new(OllamaProvider::new(
            &config.ollama_base_url,
            config.generation_model.clone(),
            config.generation_temperature,
        )?)),
        GenerationBackend::OpenAI => {
            let client = Arc::new(Client::with_config(
                async_openai::config::OpenAIConfig::new()
                    .with_api_key(&config.openai_api_key)
                    .with_api_base(&config.openai_base_url),
            ));
            Ok(Arc::new(OpenAiProvider::new(
                client,
                config.generation_model.clone(),
                config.generation_temperature,
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChatChunk {
    fn into_content(self) -> Option<String> {
        self.message
            .map(|message| message.content)
            .filter(|content| !content.is_empty())
    }
}

enum StreamLine {
    Fragment(String),
    Done(Option<String>),
    Error(String),
    Skip,
}

fn parse_stream_line(line: &[u8]) -> StreamLine {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return StreamLine::Skip;
    }
    match serde_json::from_slice::<OllamaChatChunk>(trimmed) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return StreamLine::Error(error);
            }
            if chunk.done {
                return StreamLine::Done(chunk.into_content());
            }
            chunk.into_content().map_or(StreamLine::Skip, StreamLine::Fragment)
        }
        Err(err) => {
            debug!(error = %err, line_bytes = trimmed.len(), "skipping malformed stream line");
            StreamLine::Skip
        }
    }
}

/// Splits a byte stream into newline-terminated lines across chunk boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let rest = self.pending.split_off(pos.saturating_add(1));
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim_ascii().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

impl OllamaProvider {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        temperature: Option<f32>,
    ) -> Result<Self, AppError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|e| AppError::Config(format!("invalid ollama base url '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AppError::Config(format!(
                "ollama base url must be http(s) with a host, got '{base_url}'"
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("building http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            model: model.into(),
            temperature,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, AppError> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream,
            options: self
                .temperature
                .map(|temperature| OllamaOptions { temperature }),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error("ollama chat request", &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        warn!(%status, model = %self.model, "ollama chat request rejected");
        if matches!(
            status,
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT
        ) {
            Err(AppError::ProviderUnavailable(format!(
                "ollama returned {status}: {detail}"
            )))
        } else {
            Err(AppError::Generation(format!(
                "ollama returned {status}: {detail}"
            )))
        }
    }
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        let response = self.send(messages, false).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error("ollama chat response", &e))?;

        let chunk: OllamaChatChunk = serde_json::from_slice(&body)
            .map_err(|e| AppError::Generation(format!("malformed ollama response: {e}")))?;
        if let Some(error) = chunk.error {
            return Err(AppError::Generation(error));
        }
        Ok(chunk.into_content().unwrap_or_default())
    }

    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, AppError> {
        let response = self.send(messages, true).await?;
        let mut bytes = response.bytes_stream();

        let fragments = stream! {
            let mut buffer = LineBuffer::default();
            let mut finished = false;

            while !finished {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(classify_reqwest_error("ollama stream read", &err));
                        finished = true;
                        continue;
                    }
                };

                for line in buffer.push(&chunk) {
                    match parse_stream_line(&line) {
                        StreamLine::Fragment(content) => yield Ok(ChatFragment::new(content)),
                        StreamLine::Done(last) => {
                            if let Some(content) = last {
                                yield Ok(ChatFragment::new(content));
                            }
                            finished = true;
                            break;
                        }
                        StreamLine::Error(message) => {
                            yield Err(AppError::Generation(message));
                            finished = true;
                            break;
                        }
                        StreamLine::Skip => {}
                    }
                }
            }

            if !finished {
                if let Some(line) = buffer.finish() {
                    match parse_stream_line(&line) {
                        StreamLine::Fragment(content) | StreamLine::Done(Some(content)) => {
                            yield Ok(ChatFragment::new(content));
                        }
                        StreamLine::Error(message) => yield Err(AppError::Generation(message)),
                        StreamLine::Done(None) | StreamLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(fragments))
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = self
            .client
            .get(format!("{}/api/version", self.base_url))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) if response.status().is_success() => {
                ProviderHealth::from_probe(self.name(), elapsed, None)
            }
            Ok(response) => ProviderHealth::from_probe(
                self.name(),
                elapsed,
                Some(format!("HTTP {}", response.status())),
            ),
            Err(err) => ProviderHealth::down(self.name(), err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    client: Arc<Client<async_openai::config::OpenAIConfig>>,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiProvider {
    pub fn new(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: impl Into<String>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
        }
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let converted = messages
            .iter()
            .map(to_openai_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_openai_error("building chat messages", e))?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(converted);
        if let Some(temperature) = self.temperature {
            args.temperature(temperature);
        }
        args.build()
            .map_err(|e| map_openai_error("building chat request", e))
    }
}

fn to_openai_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = message.content.clone();
    Ok(match message.role {
        MessageRole::System => ChatCompletionRequestSystemMessage::from(content).into(),
        MessageRole::User => ChatCompletionRequestUserMessage::from(content).into(),
        MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

fn map_openai_error(context: &str, err: OpenAIError) -> AppError {
    if let OpenAIError::Reqwest(inner) = &err {
        return classify_reqwest_error(context, inner);
    }
    let message = err.to_string();
    let transport_failure = matches!(err, OpenAIError::StreamError(_))
        && (message.contains("error sending request") || message.contains("Transport"));
    if transport_failure {
        AppError::ProviderUnavailable(format!("{context}: {message}"))
    } else {
        AppError::Generation(format!("{context}: {message}"))
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        let request = self.build_request(messages)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| map_openai_error("openai chat completion", e))?;

        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default())
    }

    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, AppError> {
        let request = self.build_request(messages)?;
        let mut upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| map_openai_error("openai chat stream", e))?;

        let fragments = stream! {
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(response) => {
                        let content = response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone())
                            .unwrap_or_default();
                        if !content.is_empty() {
                            yield Ok(ChatFragment::new(content));
                        }
                    }
                    Err(err) => {
                        yield Err(map_openai_error("openai chat stream", err));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(fragments))
    }

    async fn health_check(&self) -> ProviderHealth {
        let started = Instant::now();
        let result = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.client.models().list()).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(_)) => ProviderHealth::from_probe(self.name(), elapsed, None),
            Ok(Err(OpenAIError::ApiError(api))) => {
                ProviderHealth::from_probe(self.name(), elapsed, Some(api.message))
            }
            Ok(Err(err)) => ProviderHealth::down(self.name(), err.to_string()),
            Err(_) => ProviderHealth::down(self.name(), "health probe timed out".to_string()),
        }
    }
}
