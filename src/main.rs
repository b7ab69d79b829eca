//! `famcal-proxy`: run the offline caching proxy in front of a famcal backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use famcal_proxy::cache::CacheStorage;
use famcal_proxy::clients::Clients;
use famcal_proxy::context::Context;
use famcal_proxy::middleware::{
    LoggerMiddleware, MiddlewareHandler, Next, ServiceWorkerMiddleware, from_middleware,
};
use famcal_proxy::network::HttpNetwork;
use famcal_proxy::{ProxyConfig, Registration, Server};

/// Built-in famcal releases.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Release {
    /// famcal-v1: cache-first shell
    V1,
    /// famcal-v2: network-first shell with refresh, skips waiting
    V2,
}

#[derive(Debug, Parser)]
#[command(name = "famcal-proxy", version, about = "Offline caching proxy for famcal")]
struct Cli {
    /// Address pages connect to
    #[arg(long, env = "FAMCAL_PROXY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// famcal backend address (host:port)
    #[arg(long, env = "FAMCAL_PROXY_UPSTREAM", default_value = "127.0.0.1:5000")]
    upstream: String,

    /// Built-in release to deploy when no config file is given
    #[arg(long, value_enum, default_value_t = Release::V2)]
    release: Release,

    /// JSON proxy config; overrides --release
    #[arg(long, env = "FAMCAL_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to persist cache stores in; in-memory when omitted
    #[arg(long, env = "FAMCAL_PROXY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Seconds of silence after which a page counts as closed
    #[arg(long, env = "FAMCAL_PROXY_CLIENT_IDLE_SECS", default_value_t = 300)]
    client_idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("loading proxy config from {}", path.display()))?,
        None => match cli.release {
            Release::V1 => ProxyConfig::famcal_v1(),
            Release::V2 => ProxyConfig::famcal_v2(),
        },
    };

    let storage = match &cli.cache_dir {
        Some(dir) => CacheStorage::persistent(dir)
            .await
            .with_context(|| format!("opening cache directory {}", dir.display()))?,
        None => CacheStorage::in_memory(),
    };

    let registration = Arc::new(Registration::new(
        storage,
        Arc::new(HttpNetwork::new(cli.upstream.clone())),
        Arc::new(Clients::new()),
    ));

    match registration.restore().await {
        Ok(Some(version)) => info!(version = %version, "serving recorded version"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not restore recorded version"),
    }

    // An install failure is not fatal: the previous version, if any, keeps
    // serving and otherwise pages go straight to the backend.
    let version = config.version_name.clone();
    match registration.register(config).await {
        Ok(outcome) => info!(version = %version, ?outcome, "version registered"),
        Err(e) => {
            let active = registration.active_version().await;
            warn!(version = %version, ?active, error = %e, "install failed");
        }
    }

    let idle = Duration::from_secs(cli.client_idle_secs.max(1));
    let _sweeper = registration.spawn_idle_sweeper(idle / 2, idle);

    let stack: Arc<[MiddlewareHandler]> = Arc::from(vec![
        from_middleware(Arc::new(LoggerMiddleware)),
        from_middleware(Arc::new(ServiceWorkerMiddleware::new(Arc::clone(&registration)))),
    ]);

    let server = Server::bind(&cli.listen).await?;
    info!(upstream = %cli.upstream, "forwarding to famcal backend");
    server
        .run(move |request, peer| {
            let next = Next::new(Arc::clone(&stack));
            async move { next.run(Context::from_peer(request, peer)).await }
        })
        .await?;

    Ok(())
}
