//! Network drivers for model-serving backends.
//!
//! The `llm` crate defines the [`Driver`] trait along with one implementation
//! per provider family: [`OllamaDriver`] for self-hosted servers and
//! [`OpenAIDriver`] for the hosted API. Drivers are pure network adapters;
//! they know nothing about scheduling, admission or caching.

mod http;
pub mod lines;
pub mod model;
pub mod ollama;
pub mod openai;
pub mod traits;

pub use lines::LineBuffer;
pub use model::{
    ChatChunk, ChatMessage, Embeddings, EmbeddingUsage, Endpoint, InstanceVersion, ModelEntry,
    ProviderKind, Role, RunningModel, UnknownProvider, Usage,
};
pub use ollama::OllamaDriver;
pub use openai::OpenAIDriver;
pub use traits::{ChunkStream, Driver, LLMError};
