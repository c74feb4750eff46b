//! Driver for self-hosted Ollama servers.
//!
//! Health, catalog and load come from `/api/version`, `/api/tags` and
//! `/api/ps`. Chat responses stream as newline-delimited JSON from
//! `/api/chat`; embeddings come from `/api/embed`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::http;
use crate::lines::LineBuffer;
use crate::model::{
    ChatChunk, ChatMessage, EmbeddingUsage, Embeddings, Endpoint, InstanceVersion, ModelEntry, ProviderKind,
    RunningModel, Usage,
};
use crate::traits::{ChunkStream, Driver, LLMError};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OllamaDriver {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl OllamaDriver {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bound the status, catalog and load probes. Streaming calls are not
    /// affected.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for OllamaDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct VersionResponse {
    version: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    details: Option<ModelDetails>,
}

#[derive(Deserialize, Default)]
struct ModelDetails {
    family: Option<String>,
    quantization_level: Option<String>,
    parameter_size: Option<String>,
}

#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Deserialize)]
struct PsModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    size_vram: u64,
    expires_at: Option<String>,
}

#[derive(Deserialize)]
struct ChatLine {
    message: Option<ChatLineMessage>,
    error: Option<String>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    prompt_eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct UnloadResponse {
    #[serde(default)]
    done: bool,
}

/// Decode one NDJSON line of `/api/chat` output. Lines that do not parse are
/// logged and skipped.
fn parse_chat_line(line: &str) -> Option<ChatChunk> {
    let parsed: ChatLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(line, error = %e, "skipping unparseable ollama chunk");
            return None;
        }
    };
    if let Some(error) = parsed.error {
        return Some(ChatChunk::failure(error));
    }
    let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
        (None, None) => None,
        (prompt, completion) => Some(Usage {
            prompt_tokens: prompt.unwrap_or(0),
            completion_tokens: completion.unwrap_or(0),
        }),
    };
    Some(ChatChunk {
        content: parsed.message.map(|m| m.content).unwrap_or_default(),
        error: None,
        done: parsed.done,
        usage: if parsed.done { usage } else { None },
    })
}

#[async_trait]
impl Driver for OllamaDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn get_status(&self, endpoint: &Endpoint) -> Result<InstanceVersion, LLMError> {
        let res: VersionResponse = http::get_json(&self.client, endpoint, "/api/version", self.probe_timeout).await?;
        Ok(InstanceVersion { version: res.version })
    }

    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<ModelEntry>, LLMError> {
        let res: TagsResponse = http::get_json(&self.client, endpoint, "/api/tags", self.probe_timeout).await?;
        Ok(res
            .models
            .into_iter()
            .map(|m| {
                let details = m.details.unwrap_or_default();
                ModelEntry {
                    name: m.name,
                    size_bytes: m.size,
                    family: details.family,
                    quantization: details.quantization_level,
                    parameter_size: details.parameter_size,
                }
            })
            .collect())
    }

    async fn get_running_models(&self, endpoint: &Endpoint) -> Result<Vec<RunningModel>, LLMError> {
        let res: PsResponse = http::get_json(&self.client, endpoint, "/api/ps", self.probe_timeout).await?;
        Ok(res
            .models
            .into_iter()
            .map(|m| RunningModel {
                name: m.name,
                size_bytes: m.size,
                vram_bytes: m.size_vram,
                expires_at: m.expires_at,
            })
            .collect())
    }

    async fn chat_stream(
        &self,
        endpoint: &Endpoint,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, LLMError> {
        let body = json!({ "model": model, "stream": true, "messages": messages });
        let resp = http::post_stream(&self.client, endpoint, "/api/chat", &body).await?;
        let mut bytes = Box::pin(resp.bytes_stream());
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut failed = false;
            while let Some(read) = bytes.next().await {
                match read {
                    Ok(chunk) => {
                        for line in lines.push(&chunk) {
                            if let Some(decoded) = parse_chat_line(&line) {
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
                if let Some(decoded) = lines.finish().as_deref().and_then(parse_chat_line) {
                    yield Ok(decoded);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, endpoint: &Endpoint, model: &str, inputs: &[String]) -> Result<Embeddings, LLMError> {
        let body = json!({ "model": model, "input": inputs });
        let res: EmbedResponse = http::post_json(&self.client, endpoint, "/api/embed", &body).await?;
        Ok(Embeddings {
            vectors: res.embeddings,
            usage: res.prompt_eval_count.map(|n| EmbeddingUsage {
                prompt_tokens: n,
                total_tokens: n,
            }),
        })
    }

    async fn unload_model(&self, endpoint: &Endpoint, model: &str) -> Result<bool, LLMError> {
        let body = json!({ "model": model, "keep_alive": 0 });
        let res: UnloadResponse = http::post_json(&self.client, endpoint, "/api/chat", &body).await?;
        Ok(res.done)
    }
}
