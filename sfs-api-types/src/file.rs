use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a single replica of a chunk on a specific worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    /// Placement was planned or scheduled; the worker has not yet confirmed
    /// the chunk through a heartbeat.
    Pending,
    /// The worker holds the chunk and reported it.
    Committed,
    /// A read detected a checksum mismatch on this replica.
    Corrupted,
    /// Scheduled for physical removal.
    Deleted,
}

/// The assertion that a specific worker holds a specific chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub node_id: String,
    pub url: String,
    pub state: ReplicaState,
    /// Last time this placement was confirmed (heartbeat or commit).
    pub last_seen: i64,
    /// Set once the holding worker verified the stored digest.
    pub verified: bool,
}

impl ReplicaPlacement {
    /// Pending and committed placements serve reads; corrupted or deleted
    /// ones do not.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ReplicaState::Pending | ReplicaState::Committed)
    }
}

/// One fixed-size slice of a file, the unit of placement and replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: Uuid,
    /// 0-based position within the owning file.
    pub index: u32,
    pub size: u64,
    /// SHA-256 hex digest, set at commit and immutable afterwards.
    pub checksum: Option<String>,
    pub replicas: Vec<ReplicaPlacement>,
}

impl ChunkRecord {
    pub fn replica(&self, node_id: &str) -> Option<&ReplicaPlacement> {
        self.replicas.iter().find(|p| p.node_id == node_id)
    }

    pub fn replica_mut(&mut self, node_id: &str) -> Option<&mut ReplicaPlacement> {
        self.replicas.iter_mut().find(|p| p.node_id == node_id)
    }
}

/// One logical file in the namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: Uuid,
    pub path: String,
    pub size: u64,
    pub created: i64,
    pub modified: i64,
    /// Chunks in sequence-index order 0..N-1 with no gaps.
    pub chunks: Vec<ChunkRecord>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    /// Client-supplied and opaque to the core.
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub original_size: Option<u64>,
}

impl FileRecord {
    pub fn chunk(&self, chunk_id: Uuid) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.chunk_id == chunk_id)
    }

    pub fn chunk_mut(&mut self, chunk_id: Uuid) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.chunk_id == chunk_id)
    }
}
