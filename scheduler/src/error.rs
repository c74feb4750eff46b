use llm::{LLMError, ProviderKind};
use serde::Serialize;
use thiserror::Error;

/// Everything that can stop a scheduled request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no {provider} provider configured for workspace {workspace_id}")]
    NoProviderConfigured {
        workspace_id: String,
        provider: ProviderKind,
    },
    #[error("invalid {provider} provider config '{name}': {reason}")]
    InvalidProviderConfig {
        provider: ProviderKind,
        name: String,
        reason: String,
    },
    #[error("loading provider config for workspace {workspace_id}: {message}")]
    ConfigSource { workspace_id: String, message: String },
    #[error("no available instance serves model {model}")]
    NoAvailableInstance { model: String },
    #[error("unknown instance {url}")]
    UnknownInstance { url: String },
    #[error(transparent)]
    Network(#[from] LLMError),
    #[error("provider reported an error: {0}")]
    Provider(String),
    #[error("response repeated itself more than {max_repeats} times")]
    RepetitionAbort { max_repeats: usize },
    #[error("request cancelled")]
    Cancelled,
}

/// Coarse classification carried in response envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NoAvailableInstance,
    Network,
    Provider,
    RepetitionAbort,
    Cancelled,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NoProviderConfigured { .. }
            | SchedulerError::InvalidProviderConfig { .. }
            | SchedulerError::ConfigSource { .. }
            | SchedulerError::UnknownInstance { .. } => ErrorKind::Configuration,
            SchedulerError::NoAvailableInstance { .. } => ErrorKind::NoAvailableInstance,
            SchedulerError::Network(_) => ErrorKind::Network,
            SchedulerError::Provider(_) => ErrorKind::Provider,
            SchedulerError::RepetitionAbort { .. } => ErrorKind::RepetitionAbort,
            SchedulerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_share_a_kind() {
        let err = SchedulerError::NoProviderConfigured {
            workspace_id: "w1".into(),
            provider: ProviderKind::Ollama,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "no ollama provider configured for workspace w1");
    }

    #[test]
    fn driver_errors_are_network() {
        let err: SchedulerError = LLMError::Network("refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
