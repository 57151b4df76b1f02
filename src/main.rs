//! gamewire - provider node
//!
//! Runs an RPC provider from configuration, optionally registered with a
//! service center.

use clap::Parser;
use gamewire_rpc::{
    MethodDescriptor, MethodTable, NoopProviderListener, ProviderConfig, RpcProvider, RpcValue,
    ServiceCatalog, ServiceDescriptor,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gamewire")]
#[command(about = "Game backend node serving RPC over the gamewire protocol")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "GAMEWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

/// Services every node hosts.
fn diagnostics(started: Instant) -> ServiceCatalog {
    ServiceCatalog::new()
        .declare(
            ServiceDescriptor::new("node", "Diagnostics")
                .method(MethodDescriptor::new("ping").returns("string"))
                .method(MethodDescriptor::new("uptime").returns("i64")),
        )
        .implement(
            MethodTable::new()
                .method("ping()", |_| Ok(Some(RpcValue::from("pong"))))
                .method("uptime()", move |_| {
                    Ok(Some(RpcValue::I64(started.elapsed().as_millis() as i64)))
                }),
            ["node@Diagnostics"],
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ProviderConfig::load(cli.config.as_deref()).map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;
    match &cli.config {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("Using default configuration"),
    }
    if let Some(bind) = cli.bind {
        config.server.network.bind_addr = bind;
    }

    tracing::info!("Starting gamewire node '{}'", config.server.network.server_name);
    tracing::info!("  Bind address: {}", config.server.network.bind_addr);
    tracing::info!("  Provider id: {}", config.provider.provider_id);
    if config.server.handshake.secret.is_empty() {
        tracing::warn!("  Handshake secret is empty");
    }
    match &config.provider.service_center {
        Some(center) => tracing::info!("  Service center: {}:{}", center.host, center.port),
        None => tracing::info!("  Service center: none"),
    }

    let catalog = diagnostics(Instant::now());
    let provider = Arc::new(RpcProvider::new(
        config,
        &catalog,
        Arc::new(NoopProviderListener),
    )?);

    let shutdown = provider.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping node...");
        shutdown.stop();
    });

    provider.run().await?;

    tracing::info!("Node stopped");
    Ok(())
}
