use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use common::{
    error::AppError,
    types::{ChatFragment, ChatMessage, ChatRequest, MessageRole},
    utils::{
        config::default_denylist,
        content_filter::ContentFilter,
        embedding::Embedder,
        generation::{FragmentStream, GenerationProvider, HealthStatus, ProviderHealth},
    },
};
use futures::StreamExt;
use retrieval_pipeline::{Corpus, CorpusEntry};
use tokio::sync::Mutex;

use super::{ChatConfig, ChatOutcome, ChatPipeline};

const QUERY_NEAR_TWO: &str = "what does Lumen do at sunrise?";

struct MockEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl MockEmbedder {
    fn new() -> Self {
        let mut vectors = HashMap::new();
        vectors.insert(QUERY_NEAR_TWO.to_string(), vec![0.1, 1.0, 0.0]);
        Self {
            vectors,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.calls.lock().await.push(text.to_string());
        if self.fail {
            return Err(AppError::ProviderUnavailable("embedding backend offline".into()));
        }
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![1.0, 0.0, 0.0]))
    }

    fn dimension(&self) -> usize {
        3
    }
}

#[derive(Clone, Copy)]
enum Step {
    Emit(&'static str),
    Fail(&'static str),
    Hang,
}

struct MockGenerator {
    steps: Vec<Step>,
    unreachable: bool,
    released: Arc<AtomicBool>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockGenerator {
    fn scripted(steps: Vec<Step>) -> Self {
        Self {
            steps,
            unreachable: false,
            released: Arc::new(AtomicBool::new(false)),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn replying(text: &'static str) -> Self {
        Self::scripted(vec![Step::Emit(text)])
    }

    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::scripted(Vec::new())
        }
    }

    async fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().await.clone()
    }
}

struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationProvider for MockGenerator {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        self.calls.lock().await.push(messages.to_vec());
        if self.unreachable {
            return Err(AppError::ProviderUnavailable("connection refused".into()));
        }
        let mut text = String::new();
        for step in &self.steps {
            match step {
                Step::Emit(fragment) => text.push_str(fragment),
                Step::Fail(message) => return Err(AppError::Generation((*message).to_string())),
                Step::Hang => futures::future::pending::<()>().await,
            }
        }
        Ok(text)
    }

    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, AppError> {
        self.calls.lock().await.push(messages.to_vec());
        if self.unreachable {
            return Err(AppError::ProviderUnavailable("connection refused".into()));
        }
        let steps = self.steps.clone();
        let guard = ReleaseFlag(Arc::clone(&self.released));
        Ok(Box::pin(stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    Step::Emit(fragment) => yield Ok(ChatFragment::new(fragment)),
                    Step::Fail(message) => yield Err(AppError::Generation(message.to_string())),
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        }))
    }

    async fn health_check(&self) -> ProviderHealth {
        ProviderHealth {
            provider: "mock".into(),
            status: HealthStatus::Up,
            response_time_ms: Some(1),
            error: None,
        }
    }
}

fn corpus() -> Arc<Corpus> {
    let entries = vec![
        CorpusEntry {
            id: 1,
            text: "Lumen loves rainy afternoons.".into(),
            vector: vec![1.0, 0.0, 0.0],
        },
        CorpusEntry {
            id: 2,
            text: "Lumen's favourite hour is right after sunrise.".into(),
            vector: vec![0.0, 1.0, 0.0],
        },
        CorpusEntry {
            id: 3,
            text: "Lumen counts birds on early walks.".into(),
            vector: vec![0.7, 0.7, 0.0],
        },
    ];
    Arc::new(Corpus::new(entries).expect("valid corpus"))
}

fn filter() -> Arc<ContentFilter> {
    Arc::new(ContentFilter::new(default_denylist(), "[REDACTED]").expect("filter"))
}

fn config() -> ChatConfig {
    ChatConfig {
        search_limit: 2,
        persona: "You are Lumen.".into(),
        max_messages: 6,
        max_message_chars: 200,
        generation_timeout: Duration::from_secs(5),
    }
}

fn pipeline(
    embedder: &Arc<MockEmbedder>,
    generator: &Arc<MockGenerator>,
    config: ChatConfig,
) -> ChatPipeline {
    ChatPipeline::new(
        corpus(),
        Arc::clone(embedder) as Arc<dyn Embedder>,
        Arc::clone(generator) as Arc<dyn GenerationProvider>,
        filter(),
        config,
    )
}

fn user_request(text: &str, stream: bool) -> ChatRequest {
    ChatRequest::new(vec![ChatMessage::user(text)], stream)
}

fn failure<T>(result: Result<T, AppError>) -> AppError {
    match result {
        Ok(_) => panic!("expected the chat pipeline to fail"),
        Err(err) => err,
    }
}

async fn collect(stream: FragmentStream) -> Vec<Result<String, AppError>> {
    stream
        .map(|item| item.map(|fragment| fragment.content))
        .collect()
        .await
}

#[tokio::test]
async fn denied_input_fails_before_any_downstream_call() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("unused"));
    let pipeline = pipeline(&embedder, &generator, config());

    let err = failure(
        pipeline
            .handle(user_request("please run __import__('os').system('ls')", false))
            .await,
    );

    assert!(matches!(err, AppError::InvalidRequest(_)));
    assert!(embedder.calls().await.is_empty());
    assert!(generator.calls().await.is_empty());
}

#[tokio::test]
async fn malformed_conversations_are_rejected() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("unused"));
    let pipeline = pipeline(&embedder, &generator, config());

    let empty = ChatRequest::new(Vec::new(), false);
    let assistant_only = ChatRequest::new(vec![ChatMessage::assistant("hello")], false);
    let blank_user = ChatRequest::new(vec![ChatMessage::user("   ")], false);
    let too_many = ChatRequest::new(vec![ChatMessage::user("hi"); 7], false);
    let too_long = user_request(&"a".repeat(201), false);

    for request in [empty, assistant_only, blank_user, too_many, too_long] {
        let err = failure(pipeline.handle(request).await);
        assert!(matches!(err, AppError::InvalidRequest(_)), "got {err:?}");
    }
    assert!(embedder.calls().await.is_empty());
}

#[tokio::test]
async fn buffered_response_carries_filtered_text_and_quotes() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying(
        "Sunrise! ```python\nimport os\n``` Never call EVAL(x) though.",
    ));
    let pipeline = pipeline(&embedder, &generator, config());

    let request = ChatRequest::new(
        vec![
            ChatMessage::user("hi Lumen"),
            ChatMessage::assistant("hey there!"),
            ChatMessage::user(QUERY_NEAR_TWO),
        ],
        false,
    );
    let response = pipeline.respond(request).await.expect("buffered response");

    assert_eq!(response.response, "Sunrise!  Never call [REDACTED]x) though.");
    assert_eq!(response.quotes.len(), 2);
    assert_eq!(
        response.quotes,
        vec![
            "Lumen's favourite hour is right after sunrise.".to_string(),
            "Lumen counts birds on early walks.".to_string(),
        ]
    );
    assert_eq!(response.context, response.quotes.join("\n"));
    assert_eq!(embedder.calls().await, vec![QUERY_NEAR_TWO.to_string()]);
}

#[tokio::test]
async fn quotes_never_exceed_corpus_size() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("ok"));
    let pipeline = pipeline(
        &embedder,
        &generator,
        ChatConfig {
            search_limit: 10,
            ..config()
        },
    );

    let response = pipeline
        .respond(user_request(QUERY_NEAR_TWO, false))
        .await
        .expect("response");
    assert_eq!(response.quotes.len(), 3);
}

#[tokio::test]
async fn prompt_is_persona_then_conversation_in_order() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("ok"));
    let pipeline = pipeline(&embedder, &generator, config());

    let history = vec![
        ChatMessage::user("hi"),
        ChatMessage::assistant("hello"),
        ChatMessage::user(QUERY_NEAR_TWO),
    ];
    pipeline
        .respond(ChatRequest::new(history.clone(), false))
        .await
        .expect("response");

    let calls = generator.calls().await;
    assert_eq!(calls.len(), 1);
    let prompt = &calls[0];
    assert_eq!(prompt.len(), history.len() + 1);
    assert_eq!(prompt[0].role, MessageRole::System);
    assert!(prompt[0].content.starts_with("You are Lumen."));
    assert!(prompt[0].content.contains("right after sunrise"));
    assert_eq!(&prompt[1..], history.as_slice());
}

#[tokio::test]
async fn streaming_preserves_order_and_filters_each_fragment() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![
        Step::Emit("A"),
        Step::Emit("B subprocess"),
        Step::Emit("C"),
    ]));
    let pipeline = pipeline(&embedder, &generator, config());

    let outcome = pipeline
        .handle(user_request(QUERY_NEAR_TWO, true))
        .await
        .expect("stream opened");
    let ChatOutcome::Streaming(stream) = outcome else {
        panic!("expected a streaming outcome");
    };

    let fragments: Vec<String> = collect(stream)
        .await
        .into_iter()
        .map(|item| item.expect("fragment"))
        .collect();
    assert_eq!(fragments, vec!["A", "B [REDACTED]", "C"]);
}

#[tokio::test]
async fn fragments_that_filter_to_nothing_are_suppressed() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![
        Step::Emit("A"),
        Step::Emit("```rm -rf /```"),
        Step::Emit(""),
        Step::Emit("C"),
    ]));
    let pipeline = pipeline(&embedder, &generator, config());

    let stream = pipeline
        .respond_stream(user_request(QUERY_NEAR_TWO, false))
        .await
        .expect("stream opened");
    let fragments: Vec<String> = collect(stream)
        .await
        .into_iter()
        .map(|item| item.expect("fragment"))
        .collect();
    assert_eq!(fragments, vec!["A", "C"]);
}

#[tokio::test]
async fn mid_stream_failure_is_yielded_once_and_ends_the_stream() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![
        Step::Emit("partial"),
        Step::Fail("upstream reset"),
        Step::Emit("never seen"),
    ]));
    let pipeline = pipeline(&embedder, &generator, config());

    let stream = pipeline
        .respond_stream(user_request(QUERY_NEAR_TWO, true))
        .await
        .expect("stream opened");
    let items = collect(stream).await;

    assert_eq!(items.len(), 2);
    assert!(matches!(&items[0], Ok(text) if text == "partial"));
    assert!(matches!(&items[1], Err(AppError::Generation(msg)) if msg == "upstream reset"));
}

#[tokio::test]
async fn unreachable_provider_is_service_unavailable() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::unreachable());
    let pipeline = pipeline(&embedder, &generator, config());

    let buffered = failure(pipeline.respond(user_request(QUERY_NEAR_TWO, false)).await);
    assert!(matches!(buffered, AppError::ProviderUnavailable(_)));

    let streamed = failure(
        pipeline
            .respond_stream(user_request(QUERY_NEAR_TWO, true))
            .await,
    );
    assert!(matches!(streamed, AppError::ProviderUnavailable(_)));
}

#[tokio::test]
async fn generation_failure_is_wrapped() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![Step::Fail("bad payload")]));
    let pipeline = pipeline(&embedder, &generator, config());

    let err = failure(pipeline.respond(user_request(QUERY_NEAR_TWO, false)).await);
    assert!(matches!(err, AppError::Generation(msg) if msg == "bad payload"));
}

#[tokio::test]
async fn deadline_bounds_buffered_and_streamed_generation() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![Step::Emit("first"), Step::Hang]));
    let pipeline = pipeline(
        &embedder,
        &generator,
        ChatConfig {
            generation_timeout: Duration::from_millis(50),
            ..config()
        },
    );

    let buffered = failure(pipeline.respond(user_request(QUERY_NEAR_TWO, false)).await);
    assert!(matches!(buffered, AppError::ProviderUnavailable(_)));

    let stream = pipeline
        .respond_stream(user_request(QUERY_NEAR_TWO, true))
        .await
        .expect("stream opened");
    let items = collect(stream).await;
    assert_eq!(items.len(), 2);
    assert!(matches!(&items[0], Ok(text) if text == "first"));
    assert!(matches!(&items[1], Err(AppError::ProviderUnavailable(_))));
}

#[tokio::test]
async fn unrepresentable_timeout_fails_without_calling_the_provider() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("never sent"));
    let pipeline = pipeline(
        &embedder,
        &generator,
        ChatConfig {
            generation_timeout: Duration::from_secs(u64::MAX),
            ..config()
        },
    );

    let buffered = failure(pipeline.respond(user_request(QUERY_NEAR_TWO, false)).await);
    assert!(matches!(buffered, AppError::Config(_)));
    let streamed = failure(
        pipeline
            .respond_stream(user_request(QUERY_NEAR_TWO, true))
            .await,
    );
    assert!(matches!(streamed, AppError::Config(_)));
    assert!(generator.calls().await.is_empty());
}

#[tokio::test]
async fn dropping_the_stream_releases_the_upstream() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::scripted(vec![Step::Emit("first"), Step::Hang]));
    let pipeline = pipeline(&embedder, &generator, config());

    let mut stream = pipeline
        .respond_stream(user_request(QUERY_NEAR_TWO, true))
        .await
        .expect("stream opened");
    let first = stream.next().await.expect("one item").expect("fragment");
    assert_eq!(first.content, "first");
    assert!(!generator.released.load(Ordering::SeqCst));

    drop(stream);
    assert!(generator.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn embedding_outage_is_service_unavailable() {
    let embedder = Arc::new(MockEmbedder::failing());
    let generator = Arc::new(MockGenerator::replying("unused"));
    let pipeline = pipeline(&embedder, &generator, config());

    let err = failure(pipeline.respond(user_request(QUERY_NEAR_TWO, false)).await);
    assert!(matches!(err, AppError::ProviderUnavailable(_)));
    assert!(generator.calls().await.is_empty());
}

#[tokio::test]
async fn search_ranks_corpus_for_free_text() {
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(MockGenerator::replying("unused"));
    let pipeline = pipeline(&embedder, &generator, config());

    let results = pipeline.search(QUERY_NEAR_TWO, 2).await.expect("search");
    let ids: Vec<u64> = results.iter().map(|r| r.entry.id).collect();
    assert_eq!(ids, vec![2, 3]);

    let err = failure(pipeline.search("   ", 2).await);
    assert!(matches!(err, AppError::InvalidRequest(_)));
}
