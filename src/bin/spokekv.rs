//! spokekv node binary

use clap::{Parser, Subcommand};
use spokekv::common::Config;
use spokekv::replication::{self, HttpReplicationClient, Manager};
use spokekv::{Engine, Error};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "spokekv")]
#[command(about = "spokekv replicated key-value node", version)]
struct Cli {
    /// Configuration file (TOML), overridden by SPOKEKV__* variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tables and the replication API
    Leader {
        /// Table to create if missing (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Replicate every table of the configured leader
    Follower,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = spokekv::VERSION,
        node_id = config.node_id,
        "Starting spokekv"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    });

    match cli.command {
        Commands::Leader { tables } => run_leader(config, tables, cancel).await,
        Commands::Follower => run_follower(config, cancel).await,
    }
}

async fn run_leader(
    config: Config,
    tables: Vec<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listen = config.replication.listen_address.clone();
    let ready_timeout = config.raft.election_timeout() * 4;

    let engine = Arc::new(Engine::new(config)?);
    engine.start().await?;

    for name in &tables {
        match engine.create_table(name).await {
            Ok(info) => tracing::info!(table = %name, shard_id = info.shard_id, "Table ready"),
            Err(Error::TableExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        engine.wait_for_table(name, ready_timeout).await?;
    }

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    let served = replication::serve(listener, replication::router(engine.clone()), cancel).await;

    engine.close().await;
    served?;
    Ok(())
}

async fn run_follower(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let listen = config.replication.listen_address.clone();
    let client = HttpReplicationClient::from_config(&config.replication)?;

    let watcher = match (client.credential(), &config.replication.tls) {
        (Some(credential), Some(tls)) => Some(credential.watch(
            Duration::from_millis(tls.reload_interval_ms),
            cancel.child_token(),
        )),
        _ => None,
    };

    let engine = Arc::new(Engine::new(config.clone())?);
    engine.start().await?;

    let manager = Manager::new(engine.tables().clone(), Arc::new(client), &config);
    manager.start();

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    let served = replication::serve(
        listener,
        replication::maintenance_router(manager.clone()),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    manager.close().await;
    engine.close().await;
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    served?;
    Ok(())
}
