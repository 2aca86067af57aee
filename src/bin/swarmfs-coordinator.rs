use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use swarmfs::config::CoordinatorConfig;
use swarmfs::coordinator::{self, Coordinator};

#[derive(Parser)]
#[command(name = "swarmfs-coordinator", about = "swarmfs metadata coordinator")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 7070)]
    port: u16,

    /// Directory for the metadata journal and snapshots.
    #[arg(long, default_value = "/var/lib/swarmfs")]
    state_dir: PathBuf,

    /// Chunk size in bytes; authoritative for all uploads.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Target number of replicas per chunk.
    #[arg(long)]
    replication: Option<usize>,

    /// Seconds without a heartbeat before a worker counts as dead.
    #[arg(long)]
    dead_threshold: Option<i64>,

    /// Repair loop period in seconds.
    #[arg(long)]
    repair_period: Option<u64>,

    /// Maximum concurrent repair copies.
    #[arg(long)]
    max_repairs: Option<usize>,

    /// Seconds before an uncommitted upload session is abandoned.
    #[arg(long)]
    session_timeout: Option<i64>,

    /// Move chunks from busy workers to idle ones.
    #[arg(long)]
    rebalance: bool,
}

impl Args {
    fn into_config(self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig {
            host: self.host,
            port: self.port,
            state_dir: self.state_dir,
            rebalance: self.rebalance,
            ..Default::default()
        };
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(replication) = self.replication {
            config.replication = replication;
        }
        if let Some(dead_threshold) = self.dead_threshold {
            config.dead_threshold = dead_threshold;
        }
        if let Some(secs) = self.repair_period {
            config.repair_period = std::time::Duration::from_secs(secs);
        }
        if let Some(max_repairs) = self.max_repairs {
            config.max_repairs = max_repairs;
        }
        if let Some(session_timeout) = self.session_timeout {
            config.session_timeout = session_timeout;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();

    let coordinator = Coordinator::open(config.clone()).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| format_err!("unable to bind {addr} - {err}"))?;
    log::info!(
        "coordinator listening on {} (chunk size {}, replication {})",
        listener.local_addr()?,
        config.chunk_size,
        config.replication
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(coordinator::rest::serve(
        listener,
        Arc::clone(&coordinator),
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator::run_scan_loop(
        Arc::clone(&coordinator),
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator::repair::run_repair_loop(
        Arc::clone(&coordinator),
        shutdown_rx.clone(),
    ));
    tokio::spawn(coordinator::gc::run_gc_loop(
        Arc::clone(&coordinator),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(err) = server.await? {
        log::error!("server terminated with error - {err:#}");
    }
    coordinator.shutdown_compact().await?;
    log::info!("metadata snapshot written, bye");
    Ok(())
}
