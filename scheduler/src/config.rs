//! Scheduler tuning and per-workspace provider declarations.

use llm::openai::DEFAULT_BASE_URL;
use llm::{Endpoint, ProviderKind};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::SchedulerError;

const MIB: u64 = 1024 * 1024;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Tuning knobs for one [`Scheduler`](crate::Scheduler).
///
/// Durations deserialize from milliseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(deserialize_with = "millis")]
    pub status_ttl: Duration,
    #[serde(deserialize_with = "millis")]
    pub catalog_ttl: Duration,
    #[serde(deserialize_with = "millis")]
    pub load_ttl: Duration,
    #[serde(deserialize_with = "millis")]
    pub provider_cache_ttl: Duration,
    pub provider_cache_max_entries: usize,
    /// Bound on status, catalog and load probes.
    #[serde(deserialize_with = "millis")]
    pub probe_timeout: Duration,
    /// Fraction of an instance's VRAM budget held back from admission.
    pub safety_margin: f64,
    pub request_cost: RequestCost,
    /// Admission bound for providers that report no VRAM usage.
    pub hosted_max_permits: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            status_ttl: Duration::from_secs(10),
            catalog_ttl: Duration::from_secs(300),
            load_ttl: Duration::from_secs(60),
            provider_cache_ttl: Duration::from_secs(60),
            provider_cache_max_entries: 100,
            probe_timeout: Duration::from_secs(10),
            safety_margin: 0.10,
            request_cost: RequestCost::default(),
            hosted_max_permits: 16,
        }
    }
}

/// Estimated VRAM consumed by one in-flight request, by workload shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestCost {
    pub vision_bytes: u64,
    pub chat_bytes: u64,
    pub embedding_bytes: u64,
}

impl Default for RequestCost {
    fn default() -> Self {
        Self {
            vision_bytes: 100 * MIB,
            chat_bytes: 50 * MIB,
            embedding_bytes: 5 * MIB,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// One declared instance, as supplied by the workspace configuration store.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, rename = "vramGB")]
    pub vram_budget_gb: f64,
}

impl ProviderConfig {
    pub fn ollama(name: impl Into<String>, url: impl Into<String>, vram_budget_gb: f64) -> Self {
        Self {
            provider: ProviderKind::Ollama,
            name: name.into(),
            url: Some(url.into()),
            api_key: None,
            vram_budget_gb,
        }
    }

    pub fn openai(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            name: name.into(),
            url: None,
            api_key: Some(api_key.into()),
            vram_budget_gb: 0.0,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Validate the declaration and turn it into an addressable instance.
    pub fn to_instance(&self) -> Result<InstanceConfig, SchedulerError> {
        let invalid = |reason: &str| SchedulerError::InvalidProviderConfig {
            provider: self.provider,
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        let url = non_empty(&self.url);
        let api_key = non_empty(&self.api_key);
        let url = match self.provider {
            ProviderKind::Ollama => url.ok_or_else(|| invalid("missing url"))?,
            ProviderKind::OpenAi => {
                if api_key.is_none() {
                    return Err(invalid("missing api key"));
                }
                url.unwrap_or(DEFAULT_BASE_URL)
            }
        };
        if !self.vram_budget_gb.is_finite() || self.vram_budget_gb < 0.0 {
            return Err(invalid("vram budget must be a non-negative number"));
        }
        let mut endpoint = Endpoint::new(url.trim_end_matches('/'));
        if let Some(key) = api_key {
            endpoint = endpoint.with_api_key(key);
        }
        Ok(InstanceConfig {
            name: self.name.clone(),
            provider: self.provider,
            endpoint,
            vram_budget_bytes: (self.vram_budget_gb * GIB) as u64,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("vram_budget_gb", &self.vram_budget_gb)
            .finish()
    }
}

/// Static capacity declaration for one instance. Replaced wholesale when the
/// workspace configuration changes.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub provider: ProviderKind,
    pub endpoint: Endpoint,
    pub vram_budget_bytes: u64,
}

impl InstanceConfig {
    pub fn url(&self) -> &str {
        &self.endpoint.url
    }
}

/// Select and validate the declarations for `provider`.
///
/// Fails when nothing is declared or any declaration is incomplete. Duplicate
/// URLs keep their first declaration.
pub fn resolve_instances(
    workspace_id: &str,
    provider: ProviderKind,
    configs: &[ProviderConfig],
) -> Result<Vec<InstanceConfig>, SchedulerError> {
    let mut seen = HashSet::new();
    let mut instances = Vec::new();
    for config in configs.iter().filter(|c| c.provider == provider) {
        let instance = config.to_instance()?;
        if seen.insert(instance.endpoint.url.clone()) {
            instances.push(instance);
        }
    }
    if instances.is_empty() {
        return Err(SchedulerError::NoProviderConfigured {
            workspace_id: workspace_id.to_string(),
            provider,
        });
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.status_ttl, Duration::from_secs(10));
        assert_eq!(config.catalog_ttl, Duration::from_secs(300));
        assert_eq!(config.load_ttl, Duration::from_secs(60));
        assert_eq!(config.request_cost.vision_bytes, 100 * MIB);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"status_ttl": 2500, "hosted_max_permits": 4}"#).unwrap();
        assert_eq!(config.status_ttl, Duration::from_millis(2500));
        assert_eq!(config.hosted_max_permits, 4);
        assert_eq!(config.catalog_ttl, Duration::from_secs(300));
    }

    #[test]
    fn ollama_requires_url() {
        let config = ProviderConfig {
            url: Some("  ".into()),
            ..ProviderConfig::ollama("gpu", "", 16.0)
        };
        let err = config.to_instance().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidProviderConfig { .. }));
    }

    #[test]
    fn openai_requires_key_and_defaults_url() {
        let missing = ProviderConfig {
            api_key: None,
            ..ProviderConfig::openai("hosted", "")
        };
        assert!(missing.to_instance().is_err());

        let instance = ProviderConfig::openai("hosted", "sk-1").to_instance().unwrap();
        assert_eq!(instance.url(), DEFAULT_BASE_URL);
        assert_eq!(instance.endpoint.api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn vram_budget_converts_to_bytes() {
        let instance = ProviderConfig::ollama("gpu", "http://gpu-1:11434/", 16.0)
            .to_instance()
            .unwrap();
        assert_eq!(instance.vram_budget_bytes, 16 * 1024 * MIB);
        assert_eq!(instance.url(), "http://gpu-1:11434");
    }

    #[test]
    fn resolve_filters_by_provider_and_dedupes() {
        let configs = vec![
            ProviderConfig::ollama("a", "http://a:11434", 16.0),
            ProviderConfig::openai("hosted", "sk-1"),
            ProviderConfig::ollama("a-again", "http://a:11434", 8.0),
            ProviderConfig::ollama("b", "http://b:11434", 24.0),
        ];
        let instances = resolve_instances("w1", ProviderKind::Ollama, &configs).unwrap();
        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn resolve_without_declarations_fails() {
        let configs = vec![ProviderConfig::openai("hosted", "sk-1")];
        let err = resolve_instances("w1", ProviderKind::Ollama, &configs).unwrap_err();
        assert!(matches!(err, SchedulerError::NoProviderConfigured { .. }));
    }

    #[test]
    fn provider_config_reads_store_json() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"provider":"ollama","name":"gpu","url":"http://gpu:11434","vramGB":24}"#,
        )
        .unwrap();
        assert_eq!(config.vram_budget_gb, 24.0);
        assert!(!format!("{:?}", config.clone().with_api_key("secret")).contains("secret"));
    }
}
