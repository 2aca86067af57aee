//! File system based chunk store for swarmfs storage workers.
//!
//! Every chunk lives as a `<chunk_id>.chunk` / `<chunk_id>.sha256` pair in a
//! flat directory. Both files are written temp-then-rename, the body before
//! the sidecar, so a crash can never leave a sidecar without a matching body
//! and a body without a sidecar is simply invisible to the inventory.

mod chunk_store;

pub use chunk_store::{ChunkStore, ChunkWriter, ScrubStats};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    #[error("chunk {0} not found")]
    NotFound(Uuid),

    #[error("chunk {chunk_id} is corrupted - stored {stored}, computed {computed}")]
    Corrupted {
        chunk_id: Uuid,
        stored: String,
        computed: String,
    },

    #[error("no space left on chunk store")]
    NoSpace,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChunkStoreError {
    /// ENOSPC gets its own kind so the coordinator and client can treat a
    /// full worker as a placement problem rather than a generic failure.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32) {
            ChunkStoreError::NoSpace
        } else {
            ChunkStoreError::Io(err)
        }
    }
}
