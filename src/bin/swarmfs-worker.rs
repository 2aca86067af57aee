use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use swarmfs::config::WorkerConfig;
use swarmfs::worker::{heartbeat, rest, Worker};

#[derive(Parser)]
#[command(name = "swarmfs-worker", about = "swarmfs storage worker")]
struct Args {
    /// Stable worker id; defaults to node-<host>-<port>.
    #[arg(long)]
    node_id: Option<String>,

    /// Coordinator base URL.
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    coordinator_url: String,

    #[arg(long, default_value = "/var/lib/swarmfs-worker")]
    storage_path: PathBuf,

    /// Host this worker advertises to the coordinator.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7080)]
    port: u16,

    /// Optional rack label used by rack-aware placement.
    #[arg(long)]
    rack: Option<String>,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = WorkerConfig {
        node_id: args.node_id,
        coordinator_url: args.coordinator_url,
        storage_path: args.storage_path,
        host: args.host,
        port: args.port,
        rack: args.rack,
        heartbeat_interval: std::time::Duration::from_secs(args.heartbeat_interval),
        ..Default::default()
    };

    let worker = Worker::new(config.clone())?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| format_err!("unable to bind {addr} - {err}"))?;
    log::info!(
        "worker {} listening on {}",
        worker.node_id(),
        listener.local_addr()?
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(rest::serve(
        listener,
        Arc::clone(&worker),
        shutdown_rx.clone(),
    ));
    tokio::spawn(heartbeat::run_heartbeat_loop(
        Arc::clone(&worker),
        shutdown_rx.clone(),
    ));
    tokio::spawn(heartbeat::run_maintenance_loop(
        Arc::clone(&worker),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(err) = server.await? {
        log::error!("server terminated with error - {err:#}");
    }
    Ok(())
}
