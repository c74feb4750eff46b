use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;
use thiserror::Error;

use crate::model::{ChatChunk, ChatMessage, Embeddings, Endpoint, InstanceVersion, ModelEntry, ProviderKind, RunningModel};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LLMError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

impl LLMError {
    pub(crate) fn network(err: reqwest::Error) -> Self {
        LLMError::Network(err.to_string())
    }

    pub(crate) fn invalid(err: impl std::fmt::Display) -> Self {
        LLMError::InvalidResponse(err.to_string())
    }
}

/// Stream of decoded chat chunks. Unparseable lines are skipped by the
/// driver; an `Err` item means the transport failed mid-stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>;

/// Capability set every provider driver offers.
///
/// Drivers are stateless with respect to instances: each call names the
/// [`Endpoint`] it targets, so one driver value serves every instance of its
/// provider.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Liveness probe. Any error means the instance is unusable right now.
    async fn get_status(&self, endpoint: &Endpoint) -> Result<InstanceVersion, LLMError>;

    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<ModelEntry>, LLMError>;

    /// Models currently resident in memory, with their VRAM footprint.
    async fn get_running_models(&self, endpoint: &Endpoint) -> Result<Vec<RunningModel>, LLMError>;

    async fn chat_stream(
        &self,
        endpoint: &Endpoint,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, LLMError>;

    async fn embed(&self, endpoint: &Endpoint, model: &str, inputs: &[String]) -> Result<Embeddings, LLMError>;

    /// Ask the backend to evict `model` from memory. Returns whether the
    /// backend reported completion.
    async fn unload_model(&self, _endpoint: &Endpoint, _model: &str) -> Result<bool, LLMError> {
        Err(LLMError::Unsupported("unload_model"))
    }
}
