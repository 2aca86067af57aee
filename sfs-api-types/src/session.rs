use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A worker chosen to receive one chunk of an upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedTarget {
    pub node_id: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub chunk_id: Uuid,
    pub index: u32,
    pub size: u64,
    pub targets: Vec<PlannedTarget>,
}

/// Transient coordinator state binding a provisional file to its chunk plan
/// until commit or timeout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: Uuid,
    pub path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<PlannedChunk>,
    pub created: i64,
    pub overwrite: bool,
}

impl UploadSession {
    pub fn is_expired(&self, now: i64, timeout: i64) -> bool {
        now - self.created > timeout
    }
}

/// Mutual exclusion on a path under active write. Acquired by upload-init,
/// released by commit or session purge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub path: String,
    /// File id of the upload holding the lease.
    pub holder: Uuid,
    pub expires: i64,
}
