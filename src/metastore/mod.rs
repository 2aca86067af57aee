//! Coordinator metadata: an in-memory state machine fed by journaled
//! events.
//!
//! Every mutation is expressed as a [`MetaEvent`], appended to the durable
//! backend *before* it is applied in memory, so a restart replays the exact
//! mutation history. The backend is pluggable; the reference implementation
//! is a JSON-lines write-ahead log plus a periodic snapshot.

mod state;
mod wal;

pub use state::{MetaEvent, State};
pub use wal::WalBackend;

use anyhow::Error;

/// Durable backend for the coordinator metadata.
pub trait MetaBackend: Send + Sync {
    /// Persist one event; must be flushed to stable storage before
    /// returning, because the caller acknowledges the mutation afterwards.
    fn append(&self, event: &MetaEvent) -> Result<(), Error>;

    /// Reconstruct the state (snapshot plus replayed events). Returns the
    /// number of replayed WAL events so the caller can decide to compact.
    fn load(&self) -> Result<(State, u64), Error>;

    /// Atomically replace the snapshot with `state` and reset the WAL.
    fn compact(&self, state: &State) -> Result<(), Error>;
}
