use std::path::PathBuf;
use std::time::Duration;

use sfs_api_types::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DEAD_THRESHOLD, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REPLICATION,
    DEFAULT_SESSION_TIMEOUT,
};

/// Coordinator daemon configuration. Epoch-based thresholds are plain
/// seconds, loop cadences are durations so tests can shrink them.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    /// Holds the WAL and snapshot files.
    pub state_dir: PathBuf,
    pub chunk_size: u64,
    pub replication: usize,
    /// Seconds without a heartbeat before a worker counts as dead.
    pub dead_threshold: i64,
    /// Seconds before an uncommitted upload session is abandoned.
    pub session_timeout: i64,
    /// Seconds a soft-deleted file survives before the GC removes it.
    pub gc_grace: i64,
    /// Liveness and session sweep cadence.
    pub scan_period: Duration,
    pub repair_period: Duration,
    /// Concurrent cross-worker copies during repair.
    pub max_repairs: usize,
    pub gc_period: Duration,
    /// Move placements from busy workers to idle ones. Off by default.
    pub rebalance: bool,
    /// Timeout for coordinator-initiated worker requests, sized for whole
    /// chunk transfers through the proxy.
    pub worker_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7070,
            state_dir: PathBuf::from("/var/lib/swarmfs"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            replication: DEFAULT_REPLICATION,
            dead_threshold: DEFAULT_DEAD_THRESHOLD,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            gc_grace: 7 * 24 * 3600,
            scan_period: Duration::from_secs(5),
            repair_period: Duration::from_secs(60),
            max_repairs: 10,
            gc_period: Duration::from_secs(24 * 3600),
            rebalance: false,
            worker_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Stable worker identity; derived from host and port when unset.
    /// Changing host or port without changing the id is a misconfiguration.
    pub node_id: Option<String>,
    pub coordinator_url: String,
    pub storage_path: PathBuf,
    /// Host and port the worker is reachable on; advertised in heartbeats.
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
    pub heartbeat_interval: Duration,
    /// Full inventory rescan plus scrub cadence.
    pub rescan_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            coordinator_url: "http://127.0.0.1:7070".to_string(),
            storage_path: PathBuf::from("/var/lib/swarmfs-worker"),
            host: "127.0.0.1".to_string(),
            port: 7080,
            rack: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL),
            rescan_period: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    pub fn node_id(&self) -> String {
        match &self.node_id {
            Some(id) => id.clone(),
            None => format!("node-{}-{}", self.host, self.port),
        }
    }

    pub fn advertise_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
