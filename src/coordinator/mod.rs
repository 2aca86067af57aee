//! The metadata coordinator: single source of truth for the namespace,
//! placement and worker liveness.
//!
//! All mutations are serialized through one writer lock and journaled
//! before they are acknowledged; reads clone a consistent snapshot.
//! Background reconciliation (liveness scan, session sweep, repair, GC)
//! runs in dedicated tasks tied to the daemon lifetime.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Error;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::time::epoch_i64;

use sfs_api_types::{
    ChunkPlan, CommitRequest, CommitResponse, DeleteResponse, FileRecord, HealthDetails,
    HealthResponse, HeartbeatRequest, HeartbeatResponse, Lease, NodeRecord, NodeState,
    PlannedChunk, PlannedTarget, ReplicaPlacement, ReplicaState, UploadInitRequest, UploadPlan,
    UploadSession,
};
use sfs_tools::digest::is_sha256_hex;
use sfs_tools::http::HttpClient;
use sfs_tools::http_bail;

use crate::config::CoordinatorConfig;
use crate::metastore::{MetaBackend, MetaEvent, State, WalBackend};

pub mod gc;
pub mod placement;
pub mod proxy;
pub mod repair;
pub mod rest;

/// Compact the WAL into a snapshot once this many events accumulated.
const COMPACT_THRESHOLD: u64 = 10_000;

const MAX_PATH_LEN: usize = 4096;

pub struct Coordinator {
    pub config: CoordinatorConfig,
    state: RwLock<State>,
    backend: Box<dyn MetaBackend>,
    http: HttpClient,
    proxy_rr: AtomicUsize,
}

impl Coordinator {
    /// Opens the metadata store, replays the journal and re-derives worker
    /// liveness (active/inactive transitions are never journaled).
    pub async fn open(config: CoordinatorConfig) -> Result<Arc<Self>, Error> {
        let backend = WalBackend::new(&config.state_dir)?;
        let (mut state, replayed) = backend.load()?;

        let now = epoch_i64();
        for node in state.nodes.values_mut() {
            if node.state == NodeState::Active
                && now - node.last_heartbeat > config.dead_threshold
            {
                node.state = NodeState::Inactive;
            }
        }

        if replayed > COMPACT_THRESHOLD {
            backend.compact(&state)?;
        }

        log::info!(
            "metadata loaded: {} files, {} workers, {} open sessions ({} journal entries)",
            state.files.len(),
            state.nodes.len(),
            state.sessions.len(),
            replayed,
        );

        let http = HttpClient::new(config.worker_timeout);

        Ok(Arc::new(Self {
            config,
            state: RwLock::new(state),
            backend: Box::new(backend),
            http,
            proxy_rr: AtomicUsize::new(0),
        }))
    }

    /// Journal the event, then apply it. Callers hold the write lock, which
    /// is what serializes all metadata mutations.
    fn commit_event(&self, state: &mut State, event: MetaEvent) -> Result<(), Error> {
        self.backend.append(&event)?;
        state.apply(&event);
        Ok(())
    }

    pub(crate) async fn snapshot_state(&self) -> State {
        self.state.read().await.clone()
    }

    pub async fn shutdown_compact(&self) -> Result<(), Error> {
        let state = self.state.read().await;
        self.backend.compact(&state)
    }

    pub async fn upload_init(&self, request: UploadInitRequest) -> Result<UploadPlan, Error> {
        if !request.path.starts_with('/')
            || request.path.len() > MAX_PATH_LEN
            || request.path.contains('\0')
        {
            http_bail!(BAD_REQUEST, BadRequest, "invalid path {:?}", request.path);
        }

        let now = epoch_i64();
        let mut state = self.state.write().await;

        if !request.overwrite && state.live_path(&request.path).is_some() {
            http_bail!(
                CONFLICT,
                PathConflict,
                "file '{}' already exists",
                request.path
            );
        }
        if let Some(lease) = state.leases.get(&request.path) {
            if lease.expires > now {
                http_bail!(
                    CONFLICT,
                    PathConflict,
                    "path '{}' is locked by an upload in progress",
                    request.path
                );
            }
        }

        let chunk_size = self.config.chunk_size;
        let replication = self.config.replication;
        let chunk_count = if request.size == 0 {
            0
        } else {
            (request.size + chunk_size - 1) / chunk_size
        };

        let workers: Vec<NodeRecord> = state
            .active_nodes_sorted()
            .into_iter()
            .cloned()
            .collect();
        if chunk_count > 0 && workers.len() < replication {
            http_bail!(
                SERVICE_UNAVAILABLE,
                NoCapacity,
                "{} active workers, replication factor {replication}",
                workers.len()
            );
        }

        let file_id = Uuid::new_v4();
        let mut chunk_records = Vec::with_capacity(chunk_count as usize);
        let mut planned = Vec::with_capacity(chunk_count as usize);

        for index in 0..chunk_count {
            let size = if index == chunk_count - 1 {
                request.size - index * chunk_size
            } else {
                chunk_size
            };

            let targets = match placement::select_targets(
                &workers,
                index as usize,
                size,
                replication,
            ) {
                Some(targets) => targets,
                None => http_bail!(
                    SERVICE_UNAVAILABLE,
                    NoCapacity,
                    "no placement for a {size} byte chunk with replication {replication}"
                ),
            };

            let chunk_id = Uuid::new_v4();
            chunk_records.push(sfs_api_types::ChunkRecord {
                chunk_id,
                index: index as u32,
                size,
                checksum: None,
                replicas: targets
                    .iter()
                    .map(|node| ReplicaPlacement {
                        node_id: node.node_id.clone(),
                        url: node.url(),
                        state: ReplicaState::Pending,
                        last_seen: now,
                        verified: false,
                    })
                    .collect(),
            });
            planned.push(PlannedChunk {
                chunk_id,
                index: index as u32,
                size,
                targets: targets
                    .iter()
                    .map(|node| PlannedTarget {
                        node_id: node.node_id.clone(),
                        url: node.url(),
                    })
                    .collect(),
            });
        }

        let file = FileRecord {
            file_id,
            path: request.path.clone(),
            size: request.size,
            created: now,
            modified: now,
            chunks: chunk_records,
            is_deleted: false,
            deleted_at: None,
            compressed: request.compressed,
            original_size: request.original_size,
        };
        let session = UploadSession {
            file_id,
            path: request.path.clone(),
            size: request.size,
            chunk_size,
            chunks: planned,
            created: now,
            overwrite: request.overwrite,
        };
        let lease = Lease {
            lease_id: Uuid::new_v4(),
            path: request.path.clone(),
            holder: file_id,
            expires: now + self.config.session_timeout,
        };

        let plan_chunks: Vec<ChunkPlan> = session
            .chunks
            .iter()
            .map(|chunk| ChunkPlan {
                chunk_id: chunk.chunk_id,
                index: chunk.index,
                size: chunk.size,
                targets: chunk.targets.iter().map(|t| t.url.clone()).collect(),
                nodes: chunk.targets.iter().map(|t| t.node_id.clone()).collect(),
            })
            .collect();

        self.commit_event(
            &mut state,
            MetaEvent::SessionCreated {
                session,
                file,
                lease,
            },
        )?;

        log::info!(
            "upload-init {} ({} bytes, {chunk_count} chunks)",
            request.path,
            request.size
        );

        Ok(UploadPlan {
            file_id,
            chunk_size,
            chunks: plan_chunks,
        })
    }

    pub async fn commit(&self, request: CommitRequest) -> Result<CommitResponse, Error> {
        let now = epoch_i64();
        let mut state = self.state.write().await;

        let session = match state.sessions.get(&request.file_id) {
            Some(session) => session.clone(),
            None => http_bail!(
                BAD_REQUEST,
                SessionExpired,
                "upload session {} does not exist or has expired",
                request.file_id
            ),
        };

        if session.is_expired(now, self.config.session_timeout) {
            let orphans = planned_chunk_targets(&session);
            self.commit_event(
                &mut state,
                MetaEvent::SessionPurged {
                    file_id: request.file_id,
                },
            )?;
            drop(state);
            self.spawn_chunk_deletes(orphans);
            http_bail!(
                BAD_REQUEST,
                SessionExpired,
                "upload session {} has expired",
                request.file_id
            );
        }

        // every session chunk exactly once, each with at least one worker
        if request.chunks.len() != session.chunks.len() {
            http_bail!(
                BAD_REQUEST,
                BadRequest,
                "commit lists {} chunks, session has {}",
                request.chunks.len(),
                session.chunks.len()
            );
        }
        let mut by_id = HashMap::new();
        for chunk in &request.chunks {
            if by_id.insert(chunk.chunk_id, chunk).is_some() {
                http_bail!(
                    BAD_REQUEST,
                    BadRequest,
                    "chunk {} listed twice",
                    chunk.chunk_id
                );
            }
        }
        for planned in &session.chunks {
            let chunk = match by_id.get(&planned.chunk_id) {
                Some(chunk) => *chunk,
                None => http_bail!(
                    BAD_REQUEST,
                    BadRequest,
                    "chunk {} missing from commit",
                    planned.chunk_id
                ),
            };
            if chunk.nodes.is_empty() {
                http_bail!(
                    BAD_REQUEST,
                    BadRequest,
                    "chunk {} has zero reporting workers",
                    chunk.chunk_id
                );
            }
            if !is_sha256_hex(&chunk.checksum) {
                http_bail!(
                    BAD_REQUEST,
                    BadRequest,
                    "chunk {} has a malformed checksum",
                    chunk.chunk_id
                );
            }
        }

        // the path may have been published by a competing upload since init
        let replaced = match state.live_path(&session.path) {
            Some(existing) => {
                if !session.overwrite {
                    http_bail!(
                        CONFLICT,
                        PathConflict,
                        "file '{}' was created concurrently",
                        session.path
                    );
                }
                Some(existing.file_id)
            }
            None => None,
        };

        let mut node_urls = HashMap::new();
        for chunk in &request.chunks {
            for node_id in &chunk.nodes {
                if node_urls.contains_key(node_id) {
                    continue;
                }
                let url = state
                    .nodes
                    .get(node_id)
                    .map(|n| n.url())
                    .or_else(|| {
                        session
                            .chunks
                            .iter()
                            .flat_map(|p| p.targets.iter())
                            .find(|t| &t.node_id == node_id)
                            .map(|t| t.url.clone())
                    });
                match url {
                    Some(url) => {
                        node_urls.insert(node_id.clone(), url);
                    }
                    None => http_bail!(
                        BAD_REQUEST,
                        BadRequest,
                        "unknown worker '{node_id}' in commit"
                    ),
                }
            }
        }

        self.commit_event(
            &mut state,
            MetaEvent::FileCommitted {
                file_id: request.file_id,
                chunks: request.chunks.clone(),
                node_urls,
                replaced,
                at: now,
            },
        )?;

        log::info!("committed {} ({} chunks)", session.path, session.chunks.len());

        Ok(CommitResponse {
            status: "committed".to_string(),
            file_id: request.file_id,
        })
    }

    pub async fn list_files(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<FileRecord>, Error> {
        let state = self.state.read().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|f| !f.is_deleted && !state.is_provisional(&f.file_id))
            .filter(|f| prefix.map(|p| f.path.starts_with(p)).unwrap_or(true))
            .map(|f| state.api_view(f))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let offset = offset.unwrap_or(0).min(files.len());
        let mut files = files.split_off(offset);
        if let Some(limit) = limit {
            files.truncate(limit);
        }
        Ok(files)
    }

    pub async fn get_file(&self, path: &str) -> Result<FileRecord, Error> {
        let state = self.state.read().await;
        match state.live_path(path) {
            Some(file) => Ok(state.api_view(file)),
            None => http_bail!(NOT_FOUND, NotFound, "file '{path}' not found"),
        }
    }

    pub async fn delete_file(
        &self,
        path: &str,
        permanent: bool,
    ) -> Result<DeleteResponse, Error> {
        let now = epoch_i64();
        let mut state = self.state.write().await;

        let file = match state.live_path(path) {
            Some(file) => file.clone(),
            None => {
                // repeated DELETE is idempotent: success, no state change
                let already_deleted = state
                    .files
                    .values()
                    .any(|f| f.path == path && f.is_deleted);
                if already_deleted {
                    return Ok(DeleteResponse {
                        status: "deleted".to_string(),
                        path: path.to_string(),
                    });
                }
                http_bail!(NOT_FOUND, NotFound, "file '{path}' not found");
            }
        };

        self.commit_event(
            &mut state,
            MetaEvent::FileDeleted {
                file_id: file.file_id,
                at: now,
            },
        )?;

        if permanent {
            let targets = chunk_placement_targets(&file);
            self.commit_event(
                &mut state,
                MetaEvent::FilesPurged {
                    file_ids: vec![file.file_id],
                },
            )?;
            drop(state);
            self.spawn_chunk_deletes(targets);
            log::info!("permanently deleted {path}");
        } else {
            log::info!("soft-deleted {path}");
        }

        Ok(DeleteResponse {
            status: "deleted".to_string(),
            path: path.to_string(),
        })
    }

    pub async fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, Error> {
        if request.node_id.is_empty() {
            http_bail!(BAD_REQUEST, BadRequest, "heartbeat without node_id");
        }

        let now = epoch_i64();
        let node = NodeRecord {
            node_id: request.node_id,
            host: request.host,
            port: request.port,
            rack: request.rack,
            free_space: request.free_space,
            total_space: request.total_space,
            chunk_count: request.chunk_ids.len() as u64,
            last_heartbeat: now,
            // apply() keeps decommissioned nodes down
            state: NodeState::Active,
        };

        let mut state = self.state.write().await;
        self.commit_event(
            &mut state,
            MetaEvent::Heartbeat {
                node,
                chunk_ids: request.chunk_ids,
            },
        )?;

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
        })
    }

    pub async fn list_nodes(&self) -> Vec<NodeRecord> {
        let state = self.state.read().await;
        let mut nodes: Vec<NodeRecord> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeRecord, Error> {
        let state = self.state.read().await;
        match state.nodes.get(node_id) {
            Some(node) => Ok(node.clone()),
            None => http_bail!(NOT_FOUND, NotFound, "worker '{node_id}' not found"),
        }
    }

    pub async fn decommission_node(&self, node_id: &str) -> Result<NodeRecord, Error> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(node_id) {
            http_bail!(NOT_FOUND, NotFound, "worker '{node_id}' not found");
        }
        self.commit_event(
            &mut state,
            MetaEvent::NodeDecommissioned {
                node_id: node_id.to_string(),
            },
        )?;
        log::warn!("worker {node_id} decommissioned");
        match state.nodes.get(node_id) {
            Some(node) => Ok(node.clone()),
            None => http_bail!(NOT_FOUND, NotFound, "worker '{node_id}' not found"),
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let active = state.nodes.values().filter(|n| n.is_active()).count();
        HealthResponse {
            status: "ok".to_string(),
            timestamp: epoch_i64(),
            details: HealthDetails {
                total_nodes: state.nodes.len(),
                active_nodes: active,
                replication_factor: self.config.replication,
            },
        }
    }

    /// One liveness/session sweep iteration: flip dead workers to inactive
    /// and abandon expired upload sessions.
    pub async fn scan(&self) -> Result<(), Error> {
        let now = epoch_i64();
        let mut state = self.state.write().await;

        for node in state.nodes.values_mut() {
            if node.state == NodeState::Active
                && now - node.last_heartbeat > self.config.dead_threshold
            {
                node.state = NodeState::Inactive;
                log::warn!(
                    "worker {} missed heartbeats for {}s, marking inactive",
                    node.node_id,
                    now - node.last_heartbeat
                );
            }
        }

        let expired: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| s.is_expired(now, self.config.session_timeout))
            .map(|s| s.file_id)
            .collect();

        let mut orphans = Vec::new();
        for file_id in expired {
            if let Some(session) = state.sessions.get(&file_id) {
                log::info!(
                    "upload session for {} timed out, abandoning",
                    session.path
                );
                orphans.extend(planned_chunk_targets(session));
            }
            self.commit_event(&mut state, MetaEvent::SessionPurged { file_id })?;
        }
        drop(state);

        self.spawn_chunk_deletes(orphans);
        Ok(())
    }

    /// Journals a pending placement created by the repair loop; the next
    /// heartbeat of the destination promotes it.
    pub(crate) async fn add_pending_placement(
        &self,
        chunk_id: Uuid,
        node_id: String,
        url: String,
    ) -> Result<(), Error> {
        let mut state = self.state.write().await;
        self.commit_event(
            &mut state,
            MetaEvent::PlacementAdded {
                chunk_id,
                node_id,
                url,
                at: epoch_i64(),
            },
        )
    }

    /// Removes a placement and asks the worker to drop the bytes. Used by
    /// rebalancing to complete a move.
    pub(crate) async fn shed_replica(&self, chunk_id: Uuid, node_id: &str) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let url = state.nodes.get(node_id).map(|n| n.url());
        self.commit_event(
            &mut state,
            MetaEvent::PlacementRemoved {
                chunk_id,
                node_id: node_id.to_string(),
            },
        )?;
        drop(state);

        if let Some(url) = url {
            self.spawn_chunk_deletes(vec![(url, chunk_id)]);
        }
        Ok(())
    }

    pub(crate) async fn mark_replica_corrupted(&self, chunk_id: Uuid, node_id: &str) {
        let mut state = self.state.write().await;
        let result = self.commit_event(
            &mut state,
            MetaEvent::ReplicaCorrupted {
                chunk_id,
                node_id: node_id.to_string(),
            },
        );
        if let Err(err) = result {
            log::error!("unable to mark replica corrupted - {err:#}");
        }
    }

    /// Best-effort, fire-and-forget physical chunk deletes. Failures are
    /// logged; repair and the heartbeat protocol keep metadata honest.
    fn spawn_chunk_deletes(&self, targets: Vec<(String, Uuid)>) {
        if targets.is_empty() {
            return;
        }
        let http = self.http.clone();
        tokio::spawn(async move {
            for (url, chunk_id) in targets {
                let uri = format!("{url}/chunks/{chunk_id}");
                if let Err(err) = http.delete(&uri).await {
                    log::debug!("chunk delete {uri} failed - {err:#}");
                }
            }
        });
    }
}

/// Planned (worker URL, chunk id) pairs of a session, for orphan cleanup.
fn planned_chunk_targets(session: &UploadSession) -> Vec<(String, Uuid)> {
    session
        .chunks
        .iter()
        .flat_map(|chunk| {
            chunk
                .targets
                .iter()
                .map(move |t| (t.url.clone(), chunk.chunk_id))
        })
        .collect()
}

/// (worker URL, chunk id) for every placement of a file, any state.
fn chunk_placement_targets(file: &FileRecord) -> Vec<(String, Uuid)> {
    file.chunks
        .iter()
        .flat_map(|chunk| {
            chunk
                .replicas
                .iter()
                .filter(|p| !p.url.is_empty())
                .map(move |p| (p.url.clone(), chunk.chunk_id))
        })
        .collect()
}

/// Periodic liveness and session sweep.
pub async fn run_scan_loop(coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(coordinator.config.scan_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = coordinator.scan().await {
                    log::error!("liveness scan failed - {err:#}");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_api_types::CommitChunk;

    fn test_config(dir: &std::path::Path) -> CoordinatorConfig {
        CoordinatorConfig {
            state_dir: dir.to_owned(),
            chunk_size: 1024,
            replication: 2,
            ..Default::default()
        }
    }

    async fn register_workers(coordinator: &Coordinator, n: usize) {
        for i in 0..n {
            coordinator
                .heartbeat(HeartbeatRequest {
                    node_id: format!("w{i}"),
                    host: "127.0.0.1".to_string(),
                    port: 9000 + i as u16,
                    rack: None,
                    free_space: 1 << 30,
                    total_space: 1 << 31,
                    chunk_ids: Vec::new(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_upload_init_chunk_math() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(test_config(dir.path())).await.unwrap();
        register_workers(&coordinator, 2).await;

        // empty file: no chunks, commit with an empty list succeeds
        let plan = coordinator
            .upload_init(UploadInitRequest {
                path: "/empty".to_string(),
                size: 0,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap();
        assert!(plan.chunks.is_empty());
        coordinator
            .commit(CommitRequest {
                file_id: plan.file_id,
                chunks: Vec::new(),
            })
            .await
            .unwrap();
        let record = coordinator.get_file("/empty").await.unwrap();
        assert_eq!(record.size, 0);
        assert!(record.chunks.is_empty());

        // one byte: one chunk of one byte
        let plan = coordinator
            .upload_init(UploadInitRequest {
                path: "/one".to_string(),
                size: 1,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].size, 1);

        // exact multiple: full last chunk, no empty trailing chunk
        let plan = coordinator
            .upload_init(UploadInitRequest {
                path: "/exact".to_string(),
                size: 2048,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.chunks.len(), 2);
        assert!(plan.chunks.iter().all(|c| c.size == 1024));

        // one byte over: small trailing chunk
        let plan = coordinator
            .upload_init(UploadInitRequest {
                path: "/over".to_string(),
                size: 2049,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap();
        assert_eq!(plan.chunks.len(), 3);
        assert_eq!(plan.chunks[2].size, 1);
    }

    #[tokio::test]
    async fn test_upload_init_requires_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(test_config(dir.path())).await.unwrap();
        register_workers(&coordinator, 1).await; // below replication factor

        let err = coordinator
            .upload_init(UploadInitRequest {
                path: "/x".to_string(),
                size: 100,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            sfs_tools::http::error_kind(&err),
            Some(sfs_tools::http::ErrorKind::NoCapacity)
        );
    }

    #[tokio::test]
    async fn test_commit_rejects_chunk_without_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(test_config(dir.path())).await.unwrap();
        register_workers(&coordinator, 2).await;

        let plan = coordinator
            .upload_init(UploadInitRequest {
                path: "/no-nodes".to_string(),
                size: 10,
                overwrite: false,
                compressed: false,
                original_size: None,
            })
            .await
            .unwrap();

        let err = coordinator
            .commit(CommitRequest {
                file_id: plan.file_id,
                chunks: vec![CommitChunk {
                    chunk_id: plan.chunks[0].chunk_id,
                    checksum: "a".repeat(64),
                    nodes: Vec::new(),
                }],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("zero reporting workers"));
    }

    #[tokio::test]
    async fn test_second_init_on_leased_path_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::open(test_config(dir.path())).await.unwrap();
        register_workers(&coordinator, 2).await;

        let request = UploadInitRequest {
            path: "/raced".to_string(),
            size: 10,
            overwrite: false,
            compressed: false,
            original_size: None,
        };
        coordinator.upload_init(request.clone()).await.unwrap();

        let err = coordinator.upload_init(request).await.unwrap_err();
        assert_eq!(
            sfs_tools::http::error_kind(&err),
            Some(sfs_tools::http::ErrorKind::PathConflict)
        );
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let coordinator = Coordinator::open(test_config(dir.path())).await.unwrap();
            register_workers(&coordinator, 2).await;
            let plan = coordinator
                .upload_init(UploadInitRequest {
                    path: "/durable".to_string(),
                    size: 10,
                    overwrite: false,
                    compressed: false,
                    original_size: None,
                })
                .await
                .unwrap();
            coordinator
                .commit(CommitRequest {
                    file_id: plan.file_id,
                    chunks: vec![CommitChunk {
                        chunk_id: plan.chunks[0].chunk_id,
                        checksum: "b".repeat(64),
                        nodes: vec!["w0".to_string()],
                    }],
                })
                .await
                .unwrap();
        }

        let reopened = Coordinator::open(test_config(dir.path())).await.unwrap();
        let record = reopened.get_file("/durable").await.unwrap();
        assert_eq!(record.size, 10);
        assert_eq!(reopened.list_nodes().await.len(), 2);
    }
}
