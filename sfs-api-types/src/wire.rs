//! Request and response bodies of the coordinator and worker HTTP APIs.
//!
//! Everything on the wire deserializes into one of these types at the edge;
//! handlers never poke at loose JSON values.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadInitRequest {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub original_size: Option<u64>,
}

/// One chunk of an upload plan. `targets` addresses the workers directly,
/// `nodes` names them for the coordinator proxy endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunk_id: Uuid,
    pub index: u32,
    pub size: u64,
    pub targets: Vec<String>,
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadPlan {
    pub file_id: Uuid,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkPlan>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitChunk {
    pub chunk_id: Uuid,
    /// SHA-256 hex digest of the chunk bytes, computed by the client.
    pub checksum: String,
    /// Workers that acknowledged the chunk during upload.
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub file_id: Uuid,
    pub chunks: Vec<CommitChunk>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: String,
    pub file_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub status: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub rack: Option<String>,
    pub free_space: u64,
    pub total_space: u64,
    /// The worker's complete chunk inventory; authoritative.
    pub chunk_ids: Vec<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthDetails {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub replication_factor: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub details: HealthDetails,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutChunkResponse {
    pub status: String,
    pub chunk_id: Uuid,
    pub size: u64,
    pub checksum: String,
    /// Self plus every fan-out peer that acknowledged the bytes.
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHealthResponse {
    pub status: String,
    pub node_id: String,
    pub free_space: u64,
    pub total_space: u64,
    pub chunk_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub target_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub status: String,
    pub chunk_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyPutResponse {
    pub status: String,
    pub nodes: Vec<String>,
}

/// Error payload returned by both daemons on non-2xx responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub kind: Option<crate::ErrorKind>,
}
