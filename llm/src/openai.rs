//! Driver for the hosted OpenAI API.
//!
//! The hosted API has no notion of resident models or VRAM, so
//! [`Driver::get_running_models`] always reports an empty (but present) load.
//! Chat responses arrive as server-sent events.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::http;
use crate::lines::LineBuffer;
use crate::model::{
    ChatChunk, ChatMessage, EmbeddingUsage, Embeddings, Endpoint, InstanceVersion, ModelEntry, ProviderKind,
    RunningModel, Usage,
};
use crate::traits::{ChunkStream, Driver, LLMError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAIDriver {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl OpenAIDriver {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for OpenAIDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelObject>,
}

#[derive(Deserialize)]
struct ModelObject {
    id: String,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorObject {
    message: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingObject>,
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingObject {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Messages carrying images use the content-parts form with data URLs.
fn wire_message(message: &ChatMessage) -> Value {
    if message.images.is_empty() {
        return json!({ "role": message.role, "content": message.content });
    }
    let mut parts = vec![json!({ "type": "text", "text": message.content })];
    for image in &message.images {
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": format!("data:image/jpeg;base64,{image}") }
        }));
    }
    json!({ "role": message.role, "content": parts })
}

/// Decode one SSE line. Comments, keep-alives and unparseable payloads yield
/// nothing.
fn parse_sse_line(line: &str) -> Option<ChatChunk> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(ChatChunk::done(None));
    }
    let parsed: CompletionChunk = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(line, error = %e, "skipping unparseable openai chunk");
            return None;
        }
    };
    if let Some(error) = parsed.error {
        return Some(ChatChunk::failure(error.message));
    }
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();
    Some(ChatChunk {
        content,
        error: None,
        done: false,
        usage: parsed.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

#[async_trait]
impl Driver for OpenAIDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn get_status(&self, endpoint: &Endpoint) -> Result<InstanceVersion, LLMError> {
        let _: ModelsResponse = http::get_json(&self.client, endpoint, "/models", self.probe_timeout).await?;
        Ok(InstanceVersion { version: None })
    }

    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<ModelEntry>, LLMError> {
        let res: ModelsResponse = http::get_json(&self.client, endpoint, "/models", self.probe_timeout).await?;
        Ok(res.data.into_iter().map(|m| ModelEntry::new(m.id, 0)).collect())
    }

    async fn get_running_models(&self, _endpoint: &Endpoint) -> Result<Vec<RunningModel>, LLMError> {
        Ok(Vec::new())
    }

    async fn chat_stream(
        &self,
        endpoint: &Endpoint,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, LLMError> {
        let body = json!({
            "model": model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let resp = http::post_stream(&self.client, endpoint, "/chat/completions", &body).await?;
        let mut bytes = Box::pin(resp.bytes_stream());
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut failed = false;
            while let Some(read) = bytes.next().await {
                match read {
                    Ok(chunk) => {
                        for line in lines.push(&chunk) {
                            if let Some(decoded) = parse_sse_line(&line) {
                                yield Ok(decoded);
                            }
                        }
                    }
                    Err(e) => {
                        failed = true;
                        yield Err(LLMError::network(e));
                        break;
                    }
                }
            }
            if !failed {
                if let Some(decoded) = lines.finish().as_deref().and_then(parse_sse_line) {
                    yield Ok(decoded);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, endpoint: &Endpoint, model: &str, inputs: &[String]) -> Result<Embeddings, LLMError> {
        let body = json!({ "model": model, "input": inputs });
        let mut res: EmbeddingsResponse = http::post_json(&self.client, endpoint, "/embeddings", &body).await?;
        res.data.sort_by_key(|d| d.index);
        Ok(Embeddings {
            vectors: res.data.into_iter().map(|d| d.embedding).collect(),
            usage: res.usage,
        })
    }
}
