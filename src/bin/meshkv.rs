use anyhow::{Context, Result};
use clap::Parser;
use meshkv::cluster::Client;
use meshkv::common::AuthMode;
use meshkv::{Config, Coordinator, Server, StorageEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "meshkv")]
#[command(about = "meshkv node - distributed key-value store peer")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Public address of this node (host:port); defaults to localhost:<port>
    #[arg(long = "public-url")]
    public_url: Option<String>,

    /// Data directory
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Shared auth secret
    #[arg(long, default_value = "")]
    auth: String,

    /// Auth mode: none, writes, all
    #[arg(long, default_value = "none")]
    authmode: String,

    /// Rate limit (requests/sec, 0 = unlimited)
    #[arg(long, default_value_t = 0)]
    ratelimit: u64,

    /// Cache size (MiB)
    #[arg(long, default_value_t = 512)]
    cache: u64,

    /// Replication worker pool size
    #[arg(long, default_value_t = 50)]
    workers: usize,

    /// Comma-separated peer list (host:port,...)
    #[arg(long, env = "CLUSTER_NODES", default_value = "")]
    peers: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let public_addr = args
        .public_url
        .clone()
        .unwrap_or_else(|| format!("localhost:{}", args.port));

    let config = Config {
        public_addr,
        port: args.port,
        data_dir: args.data.clone(),
        auth_key: args.auth.clone(),
        auth_mode: args.authmode.parse::<AuthMode>()?,
        rate_limit: args.ratelimit,
        max_cache_bytes: args.cache * 1024 * 1024,
        workers: args.workers,
        peers: Config::parse_peers(&args.peers),
        ..Default::default()
    };
    config.validate()?;

    let engine = Arc::new(
        StorageEngine::open(&config.data_dir, config.max_cache_bytes)
            .await
            .with_context(|| format!("open data dir {}", config.data_dir.display()))?,
    );

    let client = Arc::new(Client::new(config.auth_key.clone()));
    let coordinator = Arc::new(Coordinator::new(
        config.public_addr.clone(),
        config.nodes(),
        config.replicas,
        config.workers,
        engine.clone(),
        client,
    ));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;

    tracing::info!(
        addr = %config.public_addr,
        port = config.port,
        authmode = %args.authmode,
        ratelimit = config.rate_limit,
        cache_mb = args.cache,
        workers = config.workers,
        peers = config.peers.len(),
        "meshkv starting"
    );

    let server = Arc::new(Server::new(&config, coordinator));

    tokio::select! {
        result = server.serve(listener) => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }

    engine.close().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
