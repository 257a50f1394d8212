//! cachebox daemon: pull-through cache for OCI/Docker v2 registries.
//!
//! Container runtimes point their mirror configuration here; the `ns`
//! query parameter on each request names the upstream registry to cache.

use anyhow::{Context, Result};
use cachebox_server::{create_router, CacheEngine, CacheMetrics, SkipPolicy};
use cachebox_storage::FileStore;
use cachebox_upstream::{Credentials, UpstreamClient};
use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cachebox")]
#[command(author, version, about = "Pull-through cache for OCI registries", long_about = None)]
#[command(disable_version_flag = true)]
pub struct DaemonArgs {
    /// Directory for cached objects.
    #[arg(long, short = 'd', default_value = "/tmp/data")]
    pub cache_dir: PathBuf,

    /// YAML file with default registry credentials
    /// (`host: {username, password}`).
    #[arg(long, short = 'f')]
    pub creds_file: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, short = 'p', default_value_t = 3000)]
    pub port: u16,

    /// Regex of manifest tags to never cache.
    #[arg(long, short = 't', default_value = "latest")]
    pub skip_tags: String,

    /// Cache manifests as well as blobs.
    #[arg(long, short = 'm', default_value_t = true, action = clap::ArgAction::Set)]
    pub cache_manifests: bool,

    /// Registry host whose manifests are never cached. Repeatable.
    #[arg(long = "private-registry")]
    pub private_registries: Vec<String>,

    /// Repository whose manifests are never cached. Repeatable.
    #[arg(long = "skip-image")]
    pub skip_images: Vec<String>,

    /// Log verbosity.
    #[arg(long, short = 'l', value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// S3 bucket for the cache (selects the S3 backend).
    #[arg(long, short = 'b')]
    pub bucket: Option<String>,

    /// Print version.
    #[arg(long, short = 'v', action = clap::ArgAction::Version)]
    pub version: Option<bool>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Info,
    Debug,
}

impl LogLevel {
    const fn directive(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(args).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    if args.bucket.is_some() {
        anyhow::bail!("the S3 cache backend is not available in this build (--bucket)");
    }

    let credentials = match &args.creds_file {
        Some(path) => load_credentials(path)?,
        None => HashMap::new(),
    };
    if !credentials.is_empty() {
        info!(registries = credentials.len(), "loaded default registry credentials");
    }

    let skip_tags = regex::Regex::new(&args.skip_tags)
        .with_context(|| format!("invalid --skip-tags regex `{}`", args.skip_tags))?;

    let store = FileStore::new(args.cache_dir.clone())
        .with_context(|| format!("failed to prepare cache dir {}", args.cache_dir.display()))?;
    let upstream = UpstreamClient::new().context("failed to create upstream HTTP client")?;

    let policy = SkipPolicy {
        cache_manifests: args.cache_manifests,
        skip_tags: Some(skip_tags),
        private_registries: args.private_registries.iter().cloned().collect(),
        skip_images: args.skip_images.iter().cloned().collect(),
    };

    let engine = Arc::new(CacheEngine::new(
        Arc::new(store),
        upstream,
        credentials,
        policy,
        CacheMetrics::new(),
    ));
    let app = create_router(engine);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        port = args.port,
        cache_dir = %args.cache_dir.display(),
        cache_manifests = args.cache_manifests,
        skip_tags = %args.skip_tags,
        "cachebox listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("cachebox stopped");
    Ok(())
}

/// Loads the credential table. Both fields are mandatory for every host;
/// a missing or empty field aborts startup rather than silently running
/// without credentials.
fn load_credentials(path: &Path) -> Result<HashMap<String, Credentials>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials file {}", path.display()))?;
    let credentials: HashMap<String, Credentials> = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse credentials file {}", path.display()))?;

    for (host, creds) in &credentials {
        if creds.username.is_empty() || creds.password.is_empty() {
            anyhow::bail!("credentials for `{host}` must set both username and password");
        }
    }
    Ok(credentials)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
