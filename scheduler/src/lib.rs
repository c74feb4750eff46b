//! Inference resource scheduler.
//!
//! A [`Scheduler`] brokers chat and embedding requests across the model
//! servers declared for each workspace. For every request it reconciles the
//! declared instances, refreshes stale health, catalog and load data, picks
//! the least busy instance that serves the model and waits for an admission
//! permit sized from the instance's free VRAM before dispatching.
//!
//! ```no_run
//! use llm::{ChatMessage, ProviderKind};
//! use scheduler::{ChatRequest, ProviderConfig, Scheduler, StaticProviderSource};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let source = StaticProviderSource::new().with_workspace(
//!     "w1",
//!     vec![ProviderConfig::ollama("gpu-1", "http://gpu-1:11434", 24.0)],
//! );
//! let scheduler = Scheduler::builder(Arc::new(source)).build();
//! let reply = scheduler
//!     .chat(ChatRequest::new("w1", ProviderKind::Ollama, "llama3.3", vec![ChatMessage::user("hi")]))
//!     .await;
//! println!("{}", reply.content);
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod provider_cache;
pub mod registry;
pub mod repetition;
pub mod selector;
pub mod semaphore;
pub mod status;

use llm::{Driver, OllamaDriver, OpenAIDriver, ProviderKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

pub use crate::classifier::{capabilities, classify, Capability, Classification, Confidence};
pub use crate::config::{InstanceConfig, ProviderConfig, RequestCost, SchedulerConfig};
pub use crate::dispatcher::{
    ChatRequest, ChunkCallback, EmbedRequest, EmbedResult, ErrorInfo, Issues, ResponseEnvelope, ResponseMetadata,
};
pub use crate::error::{ErrorKind, SchedulerError};
pub use crate::provider_cache::{CacheStats, ProviderCache, ProviderConfigSource, StaticProviderSource};
pub use crate::registry::Registry;
pub use crate::selector::Selection;
pub use crate::status::ClusterStatus;

type RegistryKey = (String, ProviderKind);

struct Inner {
    config: SchedulerConfig,
    source: Arc<dyn ProviderConfigSource>,
    cache: ProviderCache,
    drivers: HashMap<ProviderKind, Arc<dyn Driver>>,
    registries: RwLock<BTreeMap<RegistryKey, Arc<Registry>>>,
}

/// Owns all scheduling state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    source: Arc<dyn ProviderConfigSource>,
    drivers: HashMap<ProviderKind, Arc<dyn Driver>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `driver` for its provider instead of the default HTTP driver.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    pub fn build(mut self) -> Scheduler {
        let probe_timeout = self.config.probe_timeout;
        self.drivers
            .entry(ProviderKind::Ollama)
            .or_insert_with(|| Arc::new(OllamaDriver::new().with_probe_timeout(probe_timeout)));
        self.drivers
            .entry(ProviderKind::OpenAi)
            .or_insert_with(|| Arc::new(OpenAIDriver::new().with_probe_timeout(probe_timeout)));
        Scheduler {
            inner: Arc::new(Inner {
                cache: ProviderCache::new(self.config.provider_cache_ttl, self.config.provider_cache_max_entries),
                config: self.config,
                source: self.source,
                drivers: self.drivers,
                registries: RwLock::new(BTreeMap::new()),
            }),
        }
    }
}

/// Result of probing a declared instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnloadOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl Scheduler {
    pub fn builder(source: Arc<dyn ProviderConfigSource>) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            source,
            drivers: HashMap::new(),
        }
    }

    pub fn new(config: SchedulerConfig, source: Arc<dyn ProviderConfigSource>) -> Self {
        Self::builder(source).config(config).build()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn provider_cache(&self) -> &ProviderCache {
        &self.inner.cache
    }

    fn driver(&self, provider: ProviderKind) -> Result<Arc<dyn Driver>, SchedulerError> {
        self.inner
            .drivers
            .get(&provider)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidProviderConfig {
                provider,
                name: provider.to_string(),
                reason: "no driver registered".into(),
            })
    }

    /// Registry for `(workspace_id, provider)` if one exists.
    pub async fn registry(&self, workspace_id: &str, provider: ProviderKind) -> Option<Arc<Registry>> {
        self.inner
            .registries
            .read()
            .await
            .get(&(workspace_id.to_string(), provider))
            .cloned()
    }

    /// Resolve the workspace's declarations for `provider` along with the
    /// registry that tracks them. A workspace with nothing declared loses
    /// its registry.
    async fn prepare(
        &self,
        workspace_id: &str,
        provider: ProviderKind,
    ) -> Result<(Arc<Registry>, Vec<InstanceConfig>), SchedulerError> {
        let key = (workspace_id.to_string(), provider);
        let providers = self
            .inner
            .cache
            .get_or_load(workspace_id, self.inner.source.as_ref())
            .await?;
        let declared = match config::resolve_instances(workspace_id, provider, &providers) {
            Ok(declared) => declared,
            Err(e) => {
                if matches!(e, SchedulerError::NoProviderConfigured { .. }) {
                    self.inner.registries.write().await.remove(&key);
                }
                return Err(e);
            }
        };
        if let Some(registry) = self.inner.registries.read().await.get(&key) {
            return Ok((registry.clone(), declared));
        }
        let driver = self.driver(provider)?;
        let registry = self
            .inner
            .registries
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Registry::new(provider, driver, self.inner.config.clone())))
            .clone();
        Ok((registry, declared))
    }

    /// Reconcile the workspace's registry with its current declarations.
    pub async fn reconcile(&self, workspace_id: &str, provider: ProviderKind) -> Result<Arc<Registry>, SchedulerError> {
        let (registry, declared) = self.prepare(workspace_id, provider).await?;
        registry.reconcile(&declared).await;
        Ok(registry)
    }

    pub async fn select_best_instance(
        &self,
        workspace_id: &str,
        provider: ProviderKind,
        model: &str,
    ) -> Result<Selection, SchedulerError> {
        let (registry, declared) = self.prepare(workspace_id, provider).await?;
        registry.select_best_instance(&declared, model).await
    }

    /// Run a chat request to completion. Failures are reported in the
    /// envelope rather than returned as errors.
    pub async fn chat(&self, request: ChatRequest) -> ResponseEnvelope {
        let started = Instant::now();
        let prepared = match self.prepare(&request.workspace_id, request.provider).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(workspace = %request.workspace_id, provider = %request.provider, error = %e, "chat rejected");
                return ResponseEnvelope::failed(&e, None, started);
            }
        };
        let (registry, declared) = prepared;
        let selection = match registry.select_best_instance(&declared, &request.model).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(workspace = %request.workspace_id, model = %request.model, error = %e, "no instance for chat");
                return ResponseEnvelope::failed(&e, None, started);
            }
        };
        dispatcher::run_chat(registry.driver().as_ref(), selection, &request, started).await
    }

    /// Run a chat request in the background, yielding content increments as
    /// they arrive. The final envelope is available from
    /// [`ChatStream::response`] once the stream ends. Dropping the
    /// [`ChatStream`] cancels the request.
    pub fn chat_stream(&self, mut request: ChatRequest) -> ChatStream {
        let cancel = match &request.cancel {
            Some(caller) => caller.child_token(),
            None => CancellationToken::new(),
        };
        request.cancel = Some(cancel.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = request.on_chunk.take();
        request.on_chunk = Some(Arc::new(move |chunk: &str| {
            // The receiver may be gone; the envelope still collects everything.
            let _ = tx.send(chunk.to_string());
            if let Some(forward) = &forward {
                forward(chunk);
            }
        }));
        let scheduler = self.clone();
        ChatStream {
            chunks: UnboundedReceiverStream::new(rx),
            response: tokio::spawn(async move { scheduler.chat(request).await }),
            cancel_on_drop: cancel.drop_guard(),
        }
    }

    pub async fn embed(&self, request: EmbedRequest) -> Result<EmbedResult, SchedulerError> {
        let (registry, declared) = self.prepare(&request.workspace_id, request.provider).await?;
        let selection = registry.select_best_instance(&declared, &request.model).await?;
        dispatcher::run_embed(registry.driver().as_ref(), selection, &request).await
    }

    /// Capacity view of every tracked instance, refreshing stale entries
    /// first.
    pub async fn cluster_status(&self) -> ClusterStatus {
        let registries: Vec<(RegistryKey, Arc<Registry>)> = self
            .inner
            .registries
            .read()
            .await
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let mut reports = Vec::new();
        for ((workspace_id, _), registry) in registries {
            registry.refresh_all().await;
            for entry in registry.instances().await {
                let state = entry.lock().await;
                reports.push(status::report_instance(&workspace_id, &state, &self.inner.config));
            }
        }
        ClusterStatus::new(reports)
    }

    /// Sorted names of the models served by online instances.
    pub async fn available_models(&self, workspace_id: &str, provider: ProviderKind) -> Result<Vec<String>, SchedulerError> {
        let registry = self.reconcile(workspace_id, provider).await?;
        registry.refresh_all().await;
        let mut names = BTreeSet::new();
        for entry in registry.instances().await {
            let state = entry.lock().await;
            if let (true, Some(catalog)) = (state.status.online, &state.catalog) {
                names.extend(catalog.models.iter().map(|m| m.name.clone()));
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Probe a declaration without registering it.
    pub async fn test_connection(&self, config: &ProviderConfig) -> ConnectionTest {
        let probe = async {
            let instance = config.to_instance()?;
            let driver = self.driver(config.provider)?;
            Ok::<_, SchedulerError>(driver.get_status(&instance.endpoint).await?)
        };
        match probe.await {
            Ok(version) => ConnectionTest {
                success: true,
                version: version.version,
                error: None,
            },
            Err(e) => ConnectionTest {
                success: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Ask an instance to evict `model` from memory.
    ///
    /// A model that is not resident counts as unloaded. Driver failures are
    /// reported in the outcome; only an unknown workspace or instance is an
    /// error.
    pub async fn unload_model(
        &self,
        workspace_id: &str,
        provider: ProviderKind,
        url: &str,
        model: &str,
    ) -> Result<UnloadOutcome, SchedulerError> {
        let registry = self.reconcile(workspace_id, provider).await?;
        let url = url.trim_end_matches('/');
        let entry = registry
            .get(url)
            .await
            .ok_or_else(|| SchedulerError::UnknownInstance { url: url.to_string() })?;
        let mut state = entry.lock().await;
        registry.monitor.refresh_status(&mut state).await;
        registry.monitor.refresh_load(&mut state).await;
        if !state.status.online {
            return Ok(UnloadOutcome {
                success: false,
                reason: Some("instance offline".into()),
            });
        }
        if !state.is_resident(model) {
            return Ok(UnloadOutcome {
                success: true,
                reason: Some("model not loaded".into()),
            });
        }
        match registry.driver().unload_model(&state.config.endpoint, model).await {
            Ok(true) => {
                // Force the next selection to re-measure VRAM.
                state.load = None;
                info!(instance = %url, model, "unloaded model");
                Ok(UnloadOutcome {
                    success: true,
                    reason: None,
                })
            }
            Ok(false) => {
                warn!(instance = %url, model, "unload not completed");
                Ok(UnloadOutcome {
                    success: false,
                    reason: Some("unload not completed".into()),
                })
            }
            Err(e) => {
                warn!(instance = %url, model, error = %e, "unload failed");
                Ok(UnloadOutcome {
                    success: false,
                    reason: Some(e.to_string()),
                })
            }
        }
    }

    /// Drop the cached declarations for a workspace so the next call reloads
    /// them.
    pub async fn invalidate_workspace(&self, workspace_id: &str) -> bool {
        self.inner.cache.invalidate(workspace_id).await
    }

    /// Forget every instance and cached declaration.
    pub async fn shutdown(&self) {
        self.inner.registries.write().await.clear();
        self.inner.cache.clear_all().await;
        info!("scheduler state cleared");
    }
}

/// Content increments of a background chat request.
pub struct ChatStream {
    chunks: UnboundedReceiverStream<String>,
    response: JoinHandle<ResponseEnvelope>,
    cancel_on_drop: DropGuard,
}

impl ChatStream {
    /// Wait for the final envelope. Fails only if the request task panicked
    /// or the runtime shut down. Dropping this future early cancels the
    /// request.
    pub async fn response(self) -> Result<ResponseEnvelope, JoinError> {
        let Self {
            response, cancel_on_drop, ..
        } = self;
        let envelope = response.await;
        let _ = cancel_on_drop.disarm();
        envelope
    }
}

impl Stream for ChatStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}
