//! Command line host for the precache offline agent.
//!
//! Runs the agent against an on-disk store directory, so the offline
//! behaviour of a deployment can be checked from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Install, activate and fetch a page
//! precache run --config demos/agent.json https://leiseca.example/auth/login
//!
//! # Same store, network cut
//! precache run --config demos/agent.json --offline https://leiseca.example/auth/login
//!
//! # Inspect or wipe the stores
//! precache stores
//! precache clear
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use precache_common::{init_logging, LogConfig, LogFormat, PrecacheError, Result};
use precache_net::{Fetcher, LoaderConfig, NetError, Request, ResourceLoader, Response};
use precache_sw::{
    AgentConfig, AgentError, CacheStorage, DiskCacheStorage, ResponseSource, ServiceWorkerHost,
};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "precache")]
#[command(about = "Offline cache agent host")]
#[command(version)]
struct Cli {
    /// Directory holding the persisted stores
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log level for precache crates
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and fetch URLs through it
    Run {
        /// Agent config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Reuse the existing store and treat the network as unreachable
        #[arg(long)]
        offline: bool,
        /// URLs to fetch once the agent is active
        urls: Vec<String>,
    },

    /// List stores and their entries
    Stores,

    /// Delete every store
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(
        LogConfig::default()
            .with_level(cli.log_level)
            .with_format(cli.log_format),
    );

    let cache_dir = cli
        .cache_dir
        .unwrap_or_else(precache_common::default_cache_dir);
    let storage = Arc::new(DiskCacheStorage::new(cache_dir));

    let result = match cli.command {
        Commands::Run {
            config,
            offline,
            urls,
        } => run(&config, offline, &urls, storage).await,
        Commands::Stores => list_stores(storage.as_ref()).await,
        Commands::Clear => clear_stores(storage.as_ref()).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error [{}]: {}", e.category(), e);
            ExitCode::FAILURE
        }
    }
}

/// Network that never answers.
struct Unreachable;

#[async_trait]
impl Fetcher for Unreachable {
    async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
        Err(NetError::Offline(request.url.to_string()))
    }
}

fn lifecycle_error(e: AgentError) -> PrecacheError {
    match e {
        AgentError::Config(_) => PrecacheError::config_with_source("invalid agent config", e),
        AgentError::Storage(_) => PrecacheError::storage_with_source("store unavailable", e),
        AgentError::Network(_) | AgentError::FallbackExhausted { .. } => {
            PrecacheError::network_with_source("request failed", e)
        }
        AgentError::Install { .. } | AgentError::State(_) => {
            PrecacheError::lifecycle_with_source("agent did not start", e)
        }
    }
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
        ResponseSource::OfflinePage => "offline-page",
        ResponseSource::Bypass => "bypass",
    }
}

/// Returns `Ok(false)` when at least one URL could not be answered.
async fn run(
    config_path: &Path,
    offline: bool,
    urls: &[String],
    storage: Arc<DiskCacheStorage>,
) -> Result<bool> {
    let config = AgentConfig::from_file(config_path).map_err(|e| {
        PrecacheError::config_with_source(config_path.display().to_string(), e)
    })?;

    let network: Arc<dyn Fetcher> = if offline {
        Arc::new(Unreachable)
    } else {
        Arc::new(
            ResourceLoader::new(LoaderConfig::default())
                .map_err(|e| PrecacheError::network_with_source("cannot build HTTP client", e))?,
        )
    };

    let (host, mut events) =
        ServiceWorkerHost::new(config, storage, network).map_err(lifecycle_error)?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Agent event");
        }
    });

    if offline {
        host.resume().await.map_err(lifecycle_error)?;
        println!("resumed {}", host.agent().version_tag());
    } else {
        let (installed, activated) = host.start().await.map_err(lifecycle_error)?;
        println!("installed {} ({} resources)", installed.store, installed.cached);
        for store in &activated.deleted {
            println!("deleted stale store {store}");
        }
        for failure in &activated.failed {
            println!("could not delete {}: {}", failure.store, failure.reason);
        }
    }

    let mut all_ok = true;
    for url in urls {
        let request = match Request::parse_get(url) {
            Ok(request) => request,
            Err(e) => {
                println!("{url}: {e}");
                all_ok = false;
                continue;
            }
        };
        match host.fetch(request).await {
            Ok(answer) => println!(
                "{} {} {} ({} bytes)",
                answer.response.status.as_u16(),
                source_label(answer.source),
                url,
                answer.response.body().len()
            ),
            Err(e) => {
                println!("{url}: {e}");
                all_ok = false;
            }
        }
    }

    Ok(all_ok)
}

async fn list_stores(storage: &dyn CacheStorage) -> Result<bool> {
    let names = storage
        .keys()
        .await
        .map_err(|e| PrecacheError::storage_with_source("cannot list stores", e))?;

    if names.is_empty() {
        println!("no stores");
    }
    for name in names {
        let entries = storage
            .entries(&name)
            .await
            .map_err(|e| PrecacheError::storage_with_source(format!("cannot read {name}"), e))?;
        println!("{name} ({} entries)", entries.len());
        for entry in entries {
            println!("  {} {} {} bytes", entry.key(), entry.status, entry.body.len());
        }
    }
    Ok(true)
}

async fn clear_stores(storage: &dyn CacheStorage) -> Result<bool> {
    let names = storage
        .keys()
        .await
        .map_err(|e| PrecacheError::storage_with_source("cannot list stores", e))?;
    for name in names {
        storage
            .delete(&name)
            .await
            .map_err(|e| PrecacheError::storage_with_source(format!("cannot delete {name}"), e))?;
        println!("deleted {name}");
    }
    Ok(true)
}
