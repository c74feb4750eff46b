use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use llm::ProviderKind;
use scheduler::{ProviderConfig, Scheduler, SchedulerConfig, StaticProviderSource};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

const WORKSPACE: &str = "cli";

/// Print the capacity view of a set of inference instances as JSON.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Comma separated Ollama base URLs
    #[arg(long, env = "OLLAMA_URLS", value_delimiter = ',')]
    ollama_urls: Vec<String>,
    /// VRAM budget of each Ollama instance in GB
    #[arg(long, env = "OLLAMA_VRAM_GB", default_value_t = 16.0)]
    vram_gb: f64,
    /// Bearer token for Ollama instances behind a proxy
    #[arg(long, env = "OLLAMA_API_KEY")]
    ollama_api_key: Option<String>,
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,
    /// JSON file with scheduler tuning
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    let config: SchedulerConfig = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };

    let mut providers = Vec::new();
    for (i, url) in cli.ollama_urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()).enumerate() {
        let mut provider = ProviderConfig::ollama(format!("ollama-{}", i + 1), url, cli.vram_gb);
        if let Some(key) = &cli.ollama_api_key {
            provider = provider.with_api_key(key);
        }
        providers.push(provider);
    }
    if let Some(key) = &cli.openai_api_key {
        providers.push(ProviderConfig::openai("openai", key));
    }
    anyhow::ensure!(
        !providers.is_empty(),
        "nothing to inspect: set OLLAMA_URLS or OPENAI_API_KEY"
    );

    let kinds: BTreeSet<ProviderKind> = providers.iter().map(|p| p.provider).collect();
    let source = StaticProviderSource::new().with_workspace(WORKSPACE, providers);
    let scheduler = Scheduler::new(config, Arc::new(source));
    for provider in kinds {
        if let Err(e) = scheduler.reconcile(WORKSPACE, provider).await {
            warn!(%provider, error = %e, "skipping provider");
        }
    }

    let status = scheduler.cluster_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.available_instances == 0 {
        std::process::exit(1);
    }
    Ok(())
}
