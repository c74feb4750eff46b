
use llm::{ChatMessage, ProviderKind, Usage};
use mock_driver::{MockDriver, MockInstance, Step, GIB};
use scheduler::{
    ChatRequest, ErrorKind, ProviderConfig, RequestCost, Scheduler, SchedulerConfig, StaticProviderSource,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const GPU: &str = "http://gpu-1:11434";
const MODEL: &str = "llama3.3";

fn source(providers: Vec<ProviderConfig>) -> Arc<StaticProviderSource> {
    Arc::new(StaticProviderSource::new().with_workspace("w1", providers))
}

fn one_gpu() -> Arc<StaticProviderSource> {
    source(vec![ProviderConfig::ollama("gpu-1", GPU, 16.0)])
}

fn scheduler_with(driver: &Arc<MockDriver>, source: Arc<StaticProviderSource>) -> Scheduler {
    Scheduler::builder(source).driver(driver.clone()).build()
}

fn scripted(steps: Vec<Step>) -> Arc<MockDriver> {
    Arc::new(MockDriver::ollama().with(GPU, MockInstance::online().serving(MODEL, 4).script(steps)))
}

fn request() -> ChatRequest {
    ChatRequest::new("w1", ProviderKind::Ollama, MODEL, vec![ChatMessage::user("hello")])
}

async fn permits_in_use(scheduler: &Scheduler) -> usize {
    scheduler
        .registry("w1", ProviderKind::Ollama)
        .await
        .unwrap()
        .admission(GPU, MODEL)
        .await
        .unwrap()
        .permits_in_use()
}

#[tokio::test]
async fn streams_content_and_reports_metadata() {
    let driver = scripted(vec![
        Step::Text("Hel"),
        Step::Text("lo"),
        Step::Done(Some(Usage {
            prompt_tokens: 4,
            completion_tokens: 2,
        })),
    ]);
    let scheduler = scheduler_with(&driver, one_gpu());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let reply = scheduler
        .chat(request().on_chunk(move |c| sink.lock().unwrap().push(c.to_string())))
        .await;

    assert!(reply.success, "{:?}", reply.error);
    assert_eq!(reply.content, "Hello");
    assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);
    assert_eq!(reply.metadata.instance_url.as_deref(), Some(GPU));
    assert_eq!(reply.metadata.tokens_processed, 2);
    assert_eq!(reply.metadata.prompt_tokens, Some(4));
    assert_eq!(reply.metadata.completion_tokens, Some(2));
    assert!(reply.metadata.last_chunk_at.is_some());
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test]
async fn zero_declared_instances_fail_without_network() {
    let driver = Arc::new(MockDriver::ollama());
    let scheduler = scheduler_with(&driver, source(vec![ProviderConfig::openai("hosted", "sk-1")]));

    let reply = scheduler.chat(request()).await;

    assert!(!reply.success);
    assert_eq!(reply.error_kind(), Some(ErrorKind::Configuration));
    assert_eq!(driver.total_calls(), 0);
}

#[tokio::test]
async fn hosted_provider_without_key_is_configuration_error() {
    let driver = Arc::new(MockDriver::new(ProviderKind::OpenAi));
    let config = ProviderConfig {
        api_key: None,
        ..ProviderConfig::openai("hosted", "")
    };
    let scheduler = scheduler_with(&driver, source(vec![config]));

    let reply = scheduler
        .chat(ChatRequest::new("w1", ProviderKind::OpenAi, "gpt-4o", vec![ChatMessage::user("hi")]))
        .await;

    assert_eq!(reply.error_kind(), Some(ErrorKind::Configuration));
    assert_eq!(driver.total_calls(), 0);
}

#[tokio::test]
async fn unknown_model_has_no_available_instance() {
    let driver = scripted(vec![Step::Text("never")]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler
        .chat(ChatRequest::new("w1", ProviderKind::Ollama, "mistral", vec![ChatMessage::user("hi")]))
        .await;

    assert!(!reply.success);
    assert_eq!(reply.error_kind(), Some(ErrorKind::NoAvailableInstance));
    assert_eq!(driver.calls(GPU).chat, 0);
}

#[tokio::test]
async fn cancellation_mid_stream_keeps_partial_content() {
    let driver = scripted(vec![Step::Text("partial answer"), Step::Hang]);
    let scheduler = scheduler_with(&driver, one_gpu());
    let token = CancellationToken::new();
    let trigger = token.clone();

    let reply = scheduler
        .chat(request().with_cancellation(token).on_chunk(move |_| trigger.cancel()))
        .await;

    assert!(reply.success);
    assert!(reply.issues.partial);
    assert!(reply.issues.cancelled);
    assert!(reply.error.is_none());
    assert_eq!(reply.content, "partial answer");
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test]
async fn cancellation_while_queued_never_dispatches() {
    let release = Arc::new(Notify::new());
    let driver = scripted(vec![Step::Text("first"), Step::Wait(release.clone())]);
    let config = SchedulerConfig {
        request_cost: RequestCost {
            chat_bytes: 1024 * GIB,
            ..RequestCost::default()
        },
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::builder(one_gpu()).config(config).driver(driver.clone()).build();

    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.chat(request()).await }
    });
    while driver.calls(GPU).chat == 0 {
        tokio::task::yield_now().await;
    }

    let token = CancellationToken::new();
    let queued = tokio::spawn({
        let scheduler = scheduler.clone();
        let token = token.clone();
        async move { scheduler.chat(request().with_cancellation(token)).await }
    });
    let registry = scheduler.registry("w1", ProviderKind::Ollama).await.unwrap();
    let slot = registry.admission(GPU, MODEL).await.unwrap();
    while slot.queue_length() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();

    let cancelled = queued.await.unwrap();
    assert!(!cancelled.success);
    assert!(cancelled.issues.cancelled);
    assert_eq!(cancelled.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(driver.calls(GPU).chat, 1);

    release.notify_one();
    let finished = running.await.unwrap();
    assert!(finished.success);
    assert_eq!(finished.content, "first");
    assert_eq!(slot.permits_in_use(), 0);
    assert_eq!(slot.queue_length(), 0);
}

#[tokio::test(start_paused = true)]
async fn soft_timeout_stops_at_next_chunk() {
    let driver = scripted(vec![
        Step::Text("early "),
        Step::Delay(Duration::from_secs(5)),
        Step::Text("late"),
        Step::Text("later"),
    ]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request().with_timeout(Duration::from_secs(2))).await;

    assert!(reply.success);
    assert!(reply.issues.timed_out);
    assert!(reply.issues.partial);
    assert_eq!(reply.content, "early ");
    assert!(reply.metadata.elapsed_ms >= 5_000);
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test(start_paused = true)]
async fn slow_selection_does_not_count_against_timeout() {
    let driver = Arc::new(MockDriver::ollama().with(
        GPU,
        MockInstance::online()
            .serving(MODEL, 4)
            .slow_status(Duration::from_secs(5))
            .script(vec![Step::Text("hello"), Step::Done(None)]),
    ));
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request().with_timeout(Duration::from_secs(2))).await;

    assert!(reply.success);
    assert!(!reply.issues.timed_out);
    assert!(!reply.issues.partial);
    assert_eq!(reply.content, "hello");
    assert!(reply.metadata.elapsed_ms >= 5_000);
}

#[tokio::test]
async fn repeated_lines_abort_with_content() {
    let driver = scripted(vec![
        Step::Text("same\n"),
        Step::Text("same\n"),
        Step::Text("same\n"),
        Step::Text("never reached\n"),
    ]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request().with_max_consecutive_repeats(2)).await;

    assert!(!reply.success);
    assert_eq!(reply.error_kind(), Some(ErrorKind::RepetitionAbort));
    assert!(reply.issues.partial);
    assert_eq!(reply.content, "same\nsame\nsame\n");
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test]
async fn repetition_guard_is_opt_in() {
    let driver = scripted(vec![Step::Text("same\n"), Step::Text("same\n"), Step::Text("same\n")]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request()).await;

    assert!(reply.success);
    assert_eq!(reply.content, "same\nsame\nsame\n");
}

#[tokio::test]
async fn provider_error_chunk_fails_call() {
    let driver = scripted(vec![Step::Text("hi"), Step::Error("out of memory"), Step::Text("ignored")]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request()).await;

    assert!(!reply.success);
    assert!(!reply.issues.partial);
    assert_eq!(reply.error_kind(), Some(ErrorKind::Provider));
    assert!(reply.error.unwrap().message.contains("out of memory"));
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test]
async fn refused_connection_is_network_failure() {
    let driver = Arc::new(MockDriver::ollama().with(GPU, MockInstance::online().serving(MODEL, 4).refusing_chat()));
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request()).await;

    assert!(!reply.success);
    assert_eq!(reply.error_kind(), Some(ErrorKind::Network));
    assert_eq!(reply.metadata.instance_url.as_deref(), Some(GPU));
    assert_eq!(permits_in_use(&scheduler).await, 0);
}

#[tokio::test]
async fn dropped_connection_keeps_partial_content() {
    let driver = scripted(vec![Step::Text("half"), Step::Disconnect]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let reply = scheduler.chat(request()).await;

    assert!(!reply.success);
    assert!(reply.issues.partial);
    assert_eq!(reply.content, "half");
    assert_eq!(reply.error_kind(), Some(ErrorKind::Network));
}

#[tokio::test]
async fn chat_stream_yields_increments_then_envelope() {
    let driver = scripted(vec![Step::Text("a"), Step::Text("b"), Step::Text("c"), Step::Done(None)]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let mut stream = scheduler.chat_stream(request());
    let mut pieces = Vec::new();
    while let Some(piece) = stream.next().await {
        pieces.push(piece);
    }
    let reply = stream.response().await.unwrap();

    assert_eq!(pieces, vec!["a", "b", "c"]);
    assert_eq!(reply.content, "abc");
    assert!(reply.success);
}

#[tokio::test]
async fn cached_config_is_used_until_invalidated() {
    const GPU2: &str = "http://gpu-2:11434";
    let driver = Arc::new(
        MockDriver::ollama()
            .with(GPU, MockInstance::online().serving(MODEL, 4).script(vec![Step::Text("one")]))
            .with(GPU2, MockInstance::online().serving(MODEL, 4).script(vec![Step::Text("two")])),
    );
    let source = one_gpu();
    let scheduler = scheduler_with(&driver, source.clone());
    assert_eq!(scheduler.chat(request()).await.content, "one");

    source
        .set("w1", vec![ProviderConfig::ollama("gpu-2", GPU2, 16.0)])
        .await;
    assert_eq!(scheduler.chat(request()).await.content, "one");

    assert!(scheduler.invalidate_workspace("w1").await);
    let reply = scheduler.chat(request()).await;
    assert_eq!(reply.content, "two");
    let registry = scheduler.registry("w1", ProviderKind::Ollama).await.unwrap();
    assert!(registry.get(GPU).await.is_none());
}

#[tokio::test]
async fn dropping_chat_stream_cancels_request() {
    let driver = scripted(vec![Step::Text("a"), Step::Hang]);
    let scheduler = scheduler_with(&driver, one_gpu());

    let mut stream = scheduler.chat_stream(request());
    assert_eq!(stream.next().await.as_deref(), Some("a"));
    assert_eq!(permits_in_use(&scheduler).await, 1);
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while permits_in_use(&scheduler).await > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("permit released after the stream was dropped");
}

#[tokio::test]
async fn chat_stream_follows_caller_cancellation() {
    let driver = scripted(vec![Step::Text("a"), Step::Hang]);
    let scheduler = scheduler_with(&driver, one_gpu());
    let token = CancellationToken::new();

    let mut stream = scheduler.chat_stream(request().with_cancellation(token.clone()));
    assert_eq!(stream.next().await.as_deref(), Some("a"));
    token.cancel();
    assert_eq!(stream.next().await, None);

    let reply = stream.response().await.unwrap();
    assert!(reply.success);
    assert!(reply.issues.cancelled);
    assert_eq!(reply.content, "a");
    assert_eq!(permits_in_use(&scheduler).await, 0);
}
