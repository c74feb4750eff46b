//! Admission-controlled request execution.
//!
//! Chat consumes the driver stream one chunk at a time, applying
//! cancellation, the soft timeout and the repetition guard between chunks.
//! Every outcome, including failures, comes back as a [`ResponseEnvelope`].
//! The admission permit is an RAII guard, so it is released exactly once on
//! every path.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use llm::{ChatMessage, ChunkStream, Driver, EmbeddingUsage, ProviderKind, Usage};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, SchedulerError};
use crate::repetition::exceeds_repetition;
use crate::selector::Selection;
use crate::semaphore::{AdmissionPermit, AdmissionSlot};

/// Invoked with each content increment as it arrives.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ChatRequest {
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub cancel: Option<CancellationToken>,
    /// Soft deadline, checked whenever a chunk arrives. Measured from the
    /// moment the request queues for admission on its selected instance.
    pub timeout: Option<Duration>,
    /// Abort once the output repeats a block of lines more often than this:
    /// a block seen exactly `max` times in a row is still allowed, one more
    /// repetition aborts. Zero disables the guard.
    pub max_consecutive_repeats: Option<usize>,
    pub on_chunk: Option<ChunkCallback>,
}

impl ChatRequest {
    pub fn new(
        workspace_id: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            provider,
            model: model.into(),
            messages,
            cancel: None,
            timeout: None,
            max_consecutive_repeats: None,
            on_chunk: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_consecutive_repeats(mut self, max: usize) -> Self {
        self.max_consecutive_repeats = Some(max);
        self
    }

    pub fn on_chunk(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(callback));
        self
    }

    fn repetition_limit(&self) -> Option<usize> {
        self.max_consecutive_repeats.filter(|max| *max > 0)
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("workspace_id", &self.workspace_id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("timeout", &self.timeout)
            .field("max_consecutive_repeats", &self.max_consecutive_repeats)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct EmbedRequest {
    pub workspace_id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub inputs: Vec<String>,
}

impl EmbedRequest {
    pub fn new(
        workspace_id: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
        inputs: Vec<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            provider,
            model: model.into(),
            inputs,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedResult {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Option<EmbeddingUsage>,
    pub instance_url: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issues {
    pub timed_out: bool,
    pub partial: bool,
    pub cancelled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub instance_url: Option<String>,
    /// Content chunks received.
    pub tokens_processed: u64,
    pub elapsed_ms: u64,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SchedulerError> for ErrorInfo {
    fn from(err: &SchedulerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Final outcome of a chat call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub content: String,
    pub success: bool,
    pub issues: Issues,
    pub metadata: ResponseMetadata,
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    /// Failure before any content was produced.
    pub fn failed(err: &SchedulerError, instance_url: Option<String>, started: Instant) -> Self {
        Self {
            content: String::new(),
            success: false,
            issues: Issues {
                cancelled: err.kind() == ErrorKind::Cancelled,
                ..Issues::default()
            },
            metadata: ResponseMetadata {
                instance_url,
                elapsed_ms: elapsed_ms(started),
                ..ResponseMetadata::default()
            },
            error: Some(err.into()),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// How consumption of a stream ended.
enum StreamEnd {
    Completed,
    Cancelled,
    TimedOut,
    Failed(SchedulerError),
}

/// Content and counters gathered while a stream is consumed.
struct Accumulated {
    content: String,
    chunks: u64,
    last_chunk_at: Option<DateTime<Utc>>,
    usage: Option<Usage>,
}

impl Accumulated {
    fn new() -> Self {
        Self {
            content: String::new(),
            chunks: 0,
            last_chunk_at: None,
            usage: None,
        }
    }

    fn into_envelope(self, end: StreamEnd, instance_url: String, started: Instant) -> ResponseEnvelope {
        let has_content = !self.content.is_empty();
        let (success, issues, error) = match end {
            StreamEnd::Completed => (true, Issues::default(), None),
            StreamEnd::Cancelled => (
                true,
                Issues {
                    cancelled: true,
                    partial: true,
                    ..Issues::default()
                },
                None,
            ),
            StreamEnd::TimedOut => (
                true,
                Issues {
                    timed_out: true,
                    partial: has_content,
                    ..Issues::default()
                },
                None,
            ),
            StreamEnd::Failed(err) => {
                let partial = match &err {
                    SchedulerError::Provider(_) => false,
                    SchedulerError::RepetitionAbort { .. } => true,
                    _ => has_content,
                };
                (
                    false,
                    Issues {
                        partial,
                        ..Issues::default()
                    },
                    Some(ErrorInfo::from(&err)),
                )
            }
        };
        ResponseEnvelope {
            content: self.content,
            success,
            issues,
            metadata: ResponseMetadata {
                instance_url: Some(instance_url),
                tokens_processed: self.chunks,
                elapsed_ms: elapsed_ms(started),
                last_chunk_at: self.last_chunk_at,
                prompt_tokens: self.usage.map(|u| u.prompt_tokens),
                completion_tokens: self.usage.map(|u| u.completion_tokens),
            },
            error,
        }
    }
}

/// Wait for admission unless the caller cancels first.
async fn admit(slot: &AdmissionSlot, cancel: Option<&CancellationToken>) -> Option<AdmissionPermit> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = slot.acquire() => Some(permit),
        },
        None => Some(slot.acquire().await),
    }
}

/// Run a chat request on the selected instance.
pub(crate) async fn run_chat(
    driver: &dyn Driver,
    selection: Selection,
    request: &ChatRequest,
    started: Instant,
) -> ResponseEnvelope {
    let url = selection.instance.url().to_string();
    // The soft timeout covers the admission wait and the stream, not selection.
    let deadline_from = Instant::now();
    let Some(permit) = admit(&selection.admission, request.cancel.as_ref()).await else {
        info!(instance = %url, model = %request.model, "cancelled while queued");
        return ResponseEnvelope::failed(&SchedulerError::Cancelled, Some(url), started);
    };
    debug!(instance = %url, model = %request.model, max_permits = permit.max_permits(), "admitted");

    let stream = match driver
        .chat_stream(&selection.instance.endpoint, &request.model, &request.messages)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            drop(permit);
            let err = SchedulerError::Network(e);
            warn!(instance = %url, model = %request.model, error = %err, "chat connection failed");
            return ResponseEnvelope::failed(&err, Some(url), started);
        }
    };

    let mut acc = Accumulated::new();
    let end = consume(stream, request, deadline_from, &mut acc).await;
    drop(permit);

    match &end {
        StreamEnd::Completed => info!(instance = %url, model = %request.model, chunks = acc.chunks, "chat completed"),
        StreamEnd::Cancelled => info!(instance = %url, model = %request.model, chunks = acc.chunks, "chat cancelled"),
        StreamEnd::TimedOut => warn!(instance = %url, model = %request.model, chunks = acc.chunks, "chat timed out"),
        StreamEnd::Failed(err) => warn!(instance = %url, model = %request.model, error = %err, "chat failed"),
    }
    acc.into_envelope(end, url, started)
}

async fn consume(
    mut stream: ChunkStream,
    request: &ChatRequest,
    deadline_from: Instant,
    acc: &mut Accumulated,
) -> StreamEnd {
    let repetition_limit = request.repetition_limit();
    loop {
        // Dropping the stream on return closes the connection.
        let next = match &request.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            },
            None => stream.next().await,
        };
        let Some(item) = next else {
            return StreamEnd::Completed;
        };
        if request.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return StreamEnd::Cancelled;
        }
        if request.timeout.is_some_and(|t| deadline_from.elapsed() > t) {
            return StreamEnd::TimedOut;
        }

        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => return StreamEnd::Failed(SchedulerError::Network(e)),
        };
        if let Some(message) = chunk.error {
            return StreamEnd::Failed(SchedulerError::Provider(message));
        }
        if chunk.usage.is_some() {
            acc.usage = chunk.usage;
        }
        if !chunk.content.is_empty() {
            acc.content.push_str(&chunk.content);
            acc.chunks += 1;
            acc.last_chunk_at = Some(Utc::now());
            if let Some(callback) = &request.on_chunk {
                callback(&chunk.content);
            }
            if let Some(max_repeats) = repetition_limit {
                if exceeds_repetition(&acc.content, max_repeats) {
                    return StreamEnd::Failed(SchedulerError::RepetitionAbort { max_repeats });
                }
            }
        }
        if chunk.done {
            return StreamEnd::Completed;
        }
    }
}

/// Run an embedding request on the selected instance.
pub(crate) async fn run_embed(
    driver: &dyn Driver,
    selection: Selection,
    request: &EmbedRequest,
) -> Result<EmbedResult, SchedulerError> {
    let url = selection.instance.url().to_string();
    let permit = selection.admission.acquire().await;
    let result = driver
        .embed(&selection.instance.endpoint, &request.model, &request.inputs)
        .await;
    drop(permit);
    match result {
        Ok(embeddings) => {
            debug!(instance = %url, model = %request.model, inputs = request.inputs.len(), "embedded");
            Ok(EmbedResult {
                embeddings: embeddings.vectors,
                usage: embeddings.usage,
                instance_url: url,
            })
        }
        Err(e) => {
            warn!(instance = %url, model = %request.model, error = %e, "embedding failed");
            Err(SchedulerError::Network(e))
        }
    }
}
