//! Basic types shared by the swarmfs coordinator, worker and client.

use serde::{Deserialize, Serialize};

mod file;
mod node;
mod session;
mod wire;

pub use file::*;
pub use node::*;
pub use session::*;
pub use wire::*;

/// Default chunk size (64 MiB). The coordinator's configured value is
/// authoritative; clients must slice with whatever the upload plan returns.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default replication factor.
pub const DEFAULT_REPLICATION: usize = 3;

/// Seconds without a heartbeat after which a worker counts as dead.
pub const DEFAULT_DEAD_THRESHOLD: i64 = 30;

/// Default worker heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 10;

/// Default upload session lifetime in seconds.
pub const DEFAULT_SESSION_TIMEOUT: i64 = 3600;

/// Minimum free-space ratio a worker must keep to receive new placements.
pub const MIN_FREE_RATIO: f64 = 0.10;

/// Error classification shared between the HTTP edge and the client retry
/// logic. Serialized in error payloads as the `kind` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PathConflict,
    NoCapacity,
    NoSpace,
    Corrupted,
    Unreachable,
    SessionExpired,
    NotFound,
    IoError,
    BadRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PathConflict => "path-conflict",
            ErrorKind::NoCapacity => "no-capacity",
            ErrorKind::NoSpace => "no-space",
            ErrorKind::Corrupted => "corrupted",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::SessionExpired => "session-expired",
            ErrorKind::NotFound => "not-found",
            ErrorKind::IoError => "io-error",
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a failed request with this kind is worth repeating without
    /// changing its inputs.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::NoSpace | ErrorKind::Unreachable | ErrorKind::IoError | ErrorKind::Internal
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
