use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sfs_api_types::{
    ChunkRecord, CommitChunk, FileRecord, Lease, NodeRecord, NodeState, ReplicaPlacement,
    ReplicaState, UploadSession,
};

/// One journaled metadata mutation. Applying the same event sequence always
/// produces the same state; anything non-deterministic (timestamps, chosen
/// placements, resolved URLs) is captured in the event itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetaEvent {
    /// upload-init: provisional file, its session and the path lease.
    SessionCreated {
        session: UploadSession,
        file: FileRecord,
        lease: Lease,
    },
    /// Session expired or was abandoned; the provisional file goes with it.
    SessionPurged { file_id: Uuid },
    /// Successful commit publishes the file and soft-deletes a replaced one.
    FileCommitted {
        file_id: Uuid,
        chunks: Vec<CommitChunk>,
        /// Worker id -> reachable URL at commit time.
        node_urls: HashMap<String, String>,
        replaced: Option<Uuid>,
        at: i64,
    },
    FileDeleted { file_id: Uuid, at: i64 },
    /// Physical removal scheduled; the records disappear.
    FilesPurged { file_ids: Vec<Uuid> },
    /// Worker report; authoritative for that worker's placements.
    Heartbeat {
        node: NodeRecord,
        chunk_ids: Vec<Uuid>,
    },
    /// Repair or rebalance scheduled a copy; promoted by a later heartbeat.
    PlacementAdded {
        chunk_id: Uuid,
        node_id: String,
        url: String,
        at: i64,
    },
    PlacementRemoved { chunk_id: Uuid, node_id: String },
    /// A read through the proxy hit a digest mismatch on this replica.
    ReplicaCorrupted { chunk_id: Uuid, node_id: String },
    NodeDecommissioned { node_id: String },
}

/// The coordinator's complete metadata. Mutated only through
/// [`State::apply`]; reads clone a consistent snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    pub files: HashMap<Uuid, FileRecord>,
    pub nodes: HashMap<String, NodeRecord>,
    /// Keyed by file id; a file is provisional while its session exists.
    pub sessions: HashMap<Uuid, UploadSession>,
    /// Keyed by path.
    pub leases: HashMap<String, Lease>,

    // derived, rebuilt after deserialization
    #[serde(skip)]
    chunk_index: HashMap<Uuid, Uuid>,
    #[serde(skip)]
    path_index: HashMap<String, Uuid>,
}

impl State {
    /// Rebuilds the chunk and path indexes; call after loading a snapshot.
    pub fn rebuild_indexes(&mut self) {
        self.chunk_index.clear();
        self.path_index.clear();
        for file in self.files.values() {
            for chunk in &file.chunks {
                self.chunk_index.insert(chunk.chunk_id, file.file_id);
            }
            if !file.is_deleted && !self.sessions.contains_key(&file.file_id) {
                self.path_index.insert(file.path.clone(), file.file_id);
            }
        }
    }

    /// The published, non-deleted file at `path`, if any.
    pub fn live_path(&self, path: &str) -> Option<&FileRecord> {
        self.path_index.get(path).and_then(|id| self.files.get(id))
    }

    pub fn is_provisional(&self, file_id: &Uuid) -> bool {
        self.sessions.contains_key(file_id)
    }

    pub fn find_chunk(&self, chunk_id: Uuid) -> Option<(&FileRecord, &ChunkRecord)> {
        let file_id = self.chunk_index.get(&chunk_id)?;
        let file = self.files.get(file_id)?;
        let chunk = file.chunk(chunk_id)?;
        Some((file, chunk))
    }

    /// Active workers in stable id order; the placement policy input.
    pub fn active_nodes_sorted(&self) -> Vec<&NodeRecord> {
        let mut nodes: Vec<&NodeRecord> =
            self.nodes.values().filter(|n| n.is_active()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Copy of a record with only live replicas on active workers, the
    /// shape served by `get` and `list`.
    pub fn api_view(&self, file: &FileRecord) -> FileRecord {
        let mut view = file.clone();
        for chunk in &mut view.chunks {
            chunk.replicas.retain(|p| {
                p.is_live()
                    && self
                        .nodes
                        .get(&p.node_id)
                        .map(|n| n.is_active())
                        .unwrap_or(false)
            });
        }
        view
    }

    pub fn apply(&mut self, event: &MetaEvent) {
        match event {
            MetaEvent::SessionCreated {
                session,
                file,
                lease,
            } => {
                for chunk in &file.chunks {
                    self.chunk_index.insert(chunk.chunk_id, file.file_id);
                }
                self.files.insert(file.file_id, file.clone());
                self.sessions.insert(session.file_id, session.clone());
                self.leases.insert(lease.path.clone(), lease.clone());
            }

            MetaEvent::SessionPurged { file_id } => {
                self.sessions.remove(file_id);
                if let Some(file) = self.files.remove(file_id) {
                    for chunk in &file.chunks {
                        self.chunk_index.remove(&chunk.chunk_id);
                    }
                    self.release_lease(&file.path, *file_id);
                }
            }

            MetaEvent::FileCommitted {
                file_id,
                chunks,
                node_urls,
                replaced,
                at,
            } => {
                self.sessions.remove(file_id);

                let path = match self.files.get_mut(file_id) {
                    Some(file) => {
                        for committed in chunks {
                            if let Some(chunk) = file.chunk_mut(committed.chunk_id) {
                                chunk.checksum = Some(committed.checksum.clone());
                                chunk.replicas = committed
                                    .nodes
                                    .iter()
                                    .map(|node_id| ReplicaPlacement {
                                        node_id: node_id.clone(),
                                        url: node_urls.get(node_id).cloned().unwrap_or_default(),
                                        state: ReplicaState::Committed,
                                        last_seen: *at,
                                        verified: false,
                                    })
                                    .collect();
                            }
                        }
                        file.modified = *at;
                        file.path.clone()
                    }
                    None => {
                        log::warn!("commit for unknown file {file_id}, ignoring");
                        return;
                    }
                };

                if let Some(old_id) = replaced {
                    if let Some(old) = self.files.get_mut(old_id) {
                        old.is_deleted = true;
                        old.deleted_at = Some(*at);
                    }
                }

                self.release_lease(&path, *file_id);
                self.path_index.insert(path, *file_id);
            }

            MetaEvent::FileDeleted { file_id, at } => {
                if let Some(file) = self.files.get_mut(file_id) {
                    file.is_deleted = true;
                    file.deleted_at = Some(*at);
                    if self.path_index.get(&file.path) == Some(file_id) {
                        self.path_index.remove(&file.path);
                    }
                }
            }

            MetaEvent::FilesPurged { file_ids } => {
                for file_id in file_ids {
                    if let Some(file) = self.files.remove(file_id) {
                        for chunk in &file.chunks {
                            self.chunk_index.remove(&chunk.chunk_id);
                        }
                        if self.path_index.get(&file.path) == Some(file_id) {
                            self.path_index.remove(&file.path);
                        }
                    }
                }
            }

            MetaEvent::Heartbeat { node, chunk_ids } => {
                self.apply_heartbeat(node, chunk_ids);
            }

            MetaEvent::PlacementAdded {
                chunk_id,
                node_id,
                url,
                at,
            } => {
                let file_id = match self.chunk_index.get(chunk_id) {
                    Some(id) => *id,
                    None => return,
                };
                if let Some(chunk) = self
                    .files
                    .get_mut(&file_id)
                    .and_then(|f| f.chunk_mut(*chunk_id))
                {
                    if chunk.replica(node_id).is_none() {
                        chunk.replicas.push(ReplicaPlacement {
                            node_id: node_id.clone(),
                            url: url.clone(),
                            state: ReplicaState::Pending,
                            last_seen: *at,
                            verified: false,
                        });
                    }
                }
            }

            MetaEvent::PlacementRemoved { chunk_id, node_id } => {
                let file_id = match self.chunk_index.get(chunk_id) {
                    Some(id) => *id,
                    None => return,
                };
                if let Some(chunk) = self
                    .files
                    .get_mut(&file_id)
                    .and_then(|f| f.chunk_mut(*chunk_id))
                {
                    chunk.replicas.retain(|p| &p.node_id != node_id);
                }
            }

            MetaEvent::ReplicaCorrupted { chunk_id, node_id } => {
                let file_id = match self.chunk_index.get(chunk_id) {
                    Some(id) => *id,
                    None => return,
                };
                if let Some(placement) = self
                    .files
                    .get_mut(&file_id)
                    .and_then(|f| f.chunk_mut(*chunk_id))
                    .and_then(|c| c.replica_mut(node_id))
                {
                    placement.state = ReplicaState::Corrupted;
                    placement.verified = false;
                }
            }

            MetaEvent::NodeDecommissioned { node_id } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.state = NodeState::Decommissioned;
                }
            }
        }
    }

    /// The worker's inventory is the truth: after this, the set of chunks
    /// whose replica set includes the worker equals exactly what it
    /// reported.
    fn apply_heartbeat(&mut self, node: &NodeRecord, chunk_ids: &[Uuid]) {
        let mut record = node.clone();
        match self.nodes.get(&node.node_id) {
            Some(existing) if existing.state == NodeState::Decommissioned => {
                record.state = NodeState::Decommissioned;
            }
            Some(existing) => {
                record.state = NodeState::Active;
                if record.rack.is_none() {
                    record.rack = existing.rack.clone();
                }
            }
            None => record.state = NodeState::Active,
        }
        let node_url = record.url();
        let at = record.last_heartbeat;
        self.nodes.insert(record.node_id.clone(), record);

        // promote or create placements for everything the worker reported
        for chunk_id in chunk_ids {
            let file_id = match self.chunk_index.get(chunk_id) {
                Some(id) => *id,
                // bytes for an unknown chunk: an orphan from an abandoned
                // session or a purged file, cleaned up out of band
                None => continue,
            };
            let chunk = match self
                .files
                .get_mut(&file_id)
                .and_then(|f| f.chunk_mut(*chunk_id))
            {
                Some(chunk) => chunk,
                None => continue,
            };
            match chunk.replica_mut(&node.node_id) {
                Some(placement) => {
                    placement.state = ReplicaState::Committed;
                    placement.last_seen = at;
                    placement.url = node_url.clone();
                    placement.verified = true;
                }
                None => chunk.replicas.push(ReplicaPlacement {
                    node_id: node.node_id.clone(),
                    url: node_url.clone(),
                    state: ReplicaState::Committed,
                    last_seen: at,
                    verified: true,
                }),
            }
        }

        // drop every placement on this worker that it stopped reporting
        let reported: HashSet<Uuid> = chunk_ids.iter().copied().collect();
        for file in self.files.values_mut() {
            for chunk in &mut file.chunks {
                if !reported.contains(&chunk.chunk_id) {
                    chunk.replicas.retain(|p| p.node_id != node.node_id);
                }
            }
        }
    }

    fn release_lease(&mut self, path: &str, holder: Uuid) {
        if self.leases.get(path).map(|l| l.holder) == Some(holder) {
            self.leases.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(node_id: &str, port: u16, chunk_ids: Vec<Uuid>, at: i64) -> MetaEvent {
        MetaEvent::Heartbeat {
            node: NodeRecord {
                node_id: node_id.to_string(),
                host: "127.0.0.1".to_string(),
                port,
                rack: None,
                free_space: 1 << 30,
                total_space: 1 << 31,
                chunk_count: chunk_ids.len() as u64,
                last_heartbeat: at,
                state: NodeState::Active,
            },
            chunk_ids,
        }
    }

    fn session_with_chunks(path: &str, chunk_ids: &[Uuid]) -> (Uuid, MetaEvent) {
        let file_id = Uuid::new_v4();
        let chunks: Vec<ChunkRecord> = chunk_ids
            .iter()
            .enumerate()
            .map(|(i, &chunk_id)| ChunkRecord {
                chunk_id,
                index: i as u32,
                size: 1024,
                checksum: None,
                replicas: Vec::new(),
            })
            .collect();
        let file = FileRecord {
            file_id,
            path: path.to_string(),
            size: 1024 * chunks.len() as u64,
            created: 1000,
            modified: 1000,
            chunks,
            is_deleted: false,
            deleted_at: None,
            compressed: false,
            original_size: None,
        };
        let session = UploadSession {
            file_id,
            path: path.to_string(),
            size: file.size,
            chunk_size: 1024,
            chunks: Vec::new(),
            created: 1000,
            overwrite: false,
        };
        let lease = Lease {
            lease_id: Uuid::new_v4(),
            path: path.to_string(),
            holder: file_id,
            expires: 1000 + 3600,
        };
        (
            file_id,
            MetaEvent::SessionCreated {
                session,
                file,
                lease,
            },
        )
    }

    fn commit_event(file_id: Uuid, chunk_ids: &[Uuid], nodes: &[&str]) -> MetaEvent {
        MetaEvent::FileCommitted {
            file_id,
            chunks: chunk_ids
                .iter()
                .map(|&chunk_id| CommitChunk {
                    chunk_id,
                    checksum: "0".repeat(64),
                    nodes: nodes.iter().map(|n| n.to_string()).collect(),
                })
                .collect(),
            node_urls: nodes
                .iter()
                .map(|n| (n.to_string(), format!("http://{n}:1234")))
                .collect(),
            replaced: None,
            at: 2000,
        }
    }

    #[test]
    fn test_provisional_files_are_hidden() {
        let mut state = State::default();
        let chunk = Uuid::new_v4();
        let (file_id, created) = session_with_chunks("/a", &[chunk]);

        state.apply(&created);
        assert!(state.live_path("/a").is_none());
        assert!(state.is_provisional(&file_id));

        state.apply(&commit_event(file_id, &[chunk], &["w1"]));
        assert!(!state.is_provisional(&file_id));
        let file = state.live_path("/a").unwrap();
        assert_eq!(file.file_id, file_id);
        assert_eq!(
            file.chunks[0].replicas[0].state,
            ReplicaState::Committed
        );
        // lease released on commit
        assert!(state.leases.is_empty());
    }

    #[test]
    fn test_session_purge_drops_provisional_file() {
        let mut state = State::default();
        let chunk = Uuid::new_v4();
        let (file_id, created) = session_with_chunks("/gone", &[chunk]);

        state.apply(&created);
        state.apply(&MetaEvent::SessionPurged { file_id });

        assert!(state.files.is_empty());
        assert!(state.sessions.is_empty());
        assert!(state.leases.is_empty());
        assert!(state.find_chunk(chunk).is_none());
    }

    #[test]
    fn test_heartbeat_is_authoritative() {
        let mut state = State::default();
        let (x, y, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (file_id, created) = session_with_chunks("/hb", &[x, y, z]);

        state.apply(&created);
        state.apply(&commit_event(file_id, &[x, y, z], &["w1"]));

        // w1 reports only {x, y}: z must lose its w1 placement
        state.apply(&heartbeat("w1", 9000, vec![x, y], 3000));

        fn holds(state: &State, chunk_id: Uuid) -> bool {
            state
                .find_chunk(chunk_id)
                .map(|(_, c)| c.replica("w1").is_some())
                .unwrap_or(false)
        }
        assert!(holds(&state, x));
        assert!(holds(&state, y));
        assert!(!holds(&state, z));

        // a later heartbeat adding z back restores the placement
        state.apply(&heartbeat("w1", 9000, vec![x, y, z], 3010));
        assert!(holds(&state, z));
        let (_, chunk) = state.find_chunk(z).unwrap();
        assert_eq!(chunk.replica("w1").unwrap().state, ReplicaState::Committed);
        assert!(chunk.replica("w1").unwrap().verified);
    }

    #[test]
    fn test_heartbeat_ignores_unknown_chunks() {
        let mut state = State::default();
        state.apply(&heartbeat("w1", 9000, vec![Uuid::new_v4()], 1000));
        assert_eq!(state.nodes.len(), 1);
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_overwrite_soft_deletes_old_file() {
        let mut state = State::default();
        let old_chunk = Uuid::new_v4();
        let (old_id, old_created) = session_with_chunks("/c", &[old_chunk]);
        state.apply(&old_created);
        state.apply(&commit_event(old_id, &[old_chunk], &["w1"]));

        let new_chunk = Uuid::new_v4();
        let (new_id, new_created) = session_with_chunks("/c", &[new_chunk]);
        state.apply(&new_created);
        let mut commit = commit_event(new_id, &[new_chunk], &["w1"]);
        if let MetaEvent::FileCommitted { replaced, .. } = &mut commit {
            *replaced = Some(old_id);
        }
        state.apply(&commit);

        assert_eq!(state.live_path("/c").unwrap().file_id, new_id);
        let old = state.files.get(&old_id).unwrap();
        assert!(old.is_deleted);
        assert_eq!(old.deleted_at, Some(2000));
    }

    #[test]
    fn test_decommissioned_node_stays_down() {
        let mut state = State::default();
        state.apply(&heartbeat("w1", 9000, vec![], 1000));
        state.apply(&MetaEvent::NodeDecommissioned {
            node_id: "w1".to_string(),
        });
        state.apply(&heartbeat("w1", 9000, vec![], 2000));

        let node = state.nodes.get("w1").unwrap();
        assert_eq!(node.state, NodeState::Decommissioned);
        assert_eq!(node.last_heartbeat, 2000);
        assert!(state.active_nodes_sorted().is_empty());
    }

    #[test]
    fn test_purge_removes_records_and_indexes() {
        let mut state = State::default();
        let chunk = Uuid::new_v4();
        let (file_id, created) = session_with_chunks("/p", &[chunk]);
        state.apply(&created);
        state.apply(&commit_event(file_id, &[chunk], &["w1"]));
        state.apply(&MetaEvent::FileDeleted { file_id, at: 5000 });
        assert!(state.live_path("/p").is_none());

        state.apply(&MetaEvent::FilesPurged {
            file_ids: vec![file_id],
        });
        assert!(state.files.is_empty());
        assert!(state.find_chunk(chunk).is_none());
    }
}
