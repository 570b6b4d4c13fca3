use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fulcrum_core::{FulcrumConfig, LifecycleCallbacks, Runtime, ServiceType};
use fulcrum_core::registry::ServerRegistry;
use fulcrum_core::runtime::RegistryRuntime;
use fulcrum_core::transport::Transport;
use fulcrum_transport_redis::RedisTransport;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Entrypoint for the three process roles the fabric defines (spec.md §4):
/// the registry that brokers server ids, a game server that registers with
/// it, and a proxy that routes players onto servers.
#[derive(Parser, Debug)]
#[command(name = "fulcrum")]
#[command(about = "Distributed game server backplane", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server registry process.
    Registry {
        #[arg(long, env = "FULCRUM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },
    /// Run a game server process that registers with the registry under `family`.
    Server {
        #[arg(long)]
        family: String,
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value_t = 100)]
        max_capacity: u32,
        #[arg(long, env = "FULCRUM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },
    /// Run a proxy process that routes players onto backend servers.
    Proxy {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long)]
        port: u16,
        #[arg(long, env = "FULCRUM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },
}

fn logging_callbacks(role: &'static str) -> LifecycleCallbacks {
    LifecycleCallbacks {
        on_started: Some(Arc::new(move || info!(role, "lifecycle started"))),
        on_registration_success: Some(Arc::new(move |service_id: &str| {
            info!(role, service_id, "registered");
        })),
        on_registration_failure: Some(Arc::new(move |e| {
            tracing::error!(role, error = %e, "registration failed");
        })),
        on_shutdown: Some(Arc::new(move || info!(role, "shutting down"))),
        on_stopped: Some(Arc::new(move || info!(role, "stopped"))),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fulcrum=info".parse()?))
        .init();

    let args = Args::parse();
    let config = FulcrumConfig::load().context("failed to load configuration")?;

    match args.command {
        Command::Registry { redis_url } => {
            let transport: Arc<dyn Transport> = Arc::new(
                RedisTransport::connect(&redis_url)
                    .await
                    .context("failed to connect to redis")?,
            );
            let runtime = RegistryRuntime::new(transport, config).await?;
            runtime.start().await?;
            info!("registry listening");
            log_registry_stats_periodically(runtime.registry());
            wait_for_shutdown().await;
        }
        Command::Server {
            family,
            address,
            port,
            max_capacity,
            redis_url,
        } => {
            let transport: Arc<dyn Transport> = Arc::new(
                RedisTransport::connect(&redis_url)
                    .await
                    .context("failed to connect to redis")?,
            );
            let runtime = Runtime::new(
                transport,
                ServiceType::Server,
                family,
                address,
                port,
                max_capacity,
                config,
                logging_callbacks("server"),
            )
            .await?;
            runtime.start().await?;
            wait_for_shutdown().await;
            runtime.shutdown().await?;
        }
        Command::Proxy { address, port, redis_url } => {
            let transport: Arc<dyn Transport> = Arc::new(
                RedisTransport::connect(&redis_url)
                    .await
                    .context("failed to connect to redis")?,
            );
            let runtime = Runtime::new(
                transport,
                ServiceType::Proxy,
                "proxy",
                address,
                port,
                0,
                config,
                logging_callbacks("proxy"),
            )
            .await?;
            runtime.start().await?;
            wait_for_shutdown().await;
            runtime.shutdown().await?;
        }
    }

    Ok(())
}

fn log_registry_stats_periodically(registry: Arc<ServerRegistry>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            match registry.stats().await {
                Ok(stats) => info!(?stats, "registry stats"),
                Err(e) => tracing::warn!(error = %e, "failed to collect registry stats"),
            }
        }
    });
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
}
