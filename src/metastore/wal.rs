use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{format_err, Context, Error};

use super::{MetaBackend, MetaEvent, State};

const WAL_NAME: &str = "meta.wal";
const SNAPSHOT_NAME: &str = "meta.snapshot";

/// JSON-lines write-ahead log plus snapshot file, the reference
/// [`MetaBackend`]. Exactly one process writes it.
pub struct WalBackend {
    wal_path: PathBuf,
    snapshot_path: PathBuf,
    file: Mutex<File>,
}

impl WalBackend {
    pub fn new<P: Into<PathBuf>>(state_dir: P) -> Result<Self, Error> {
        let state_dir: PathBuf = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .map_err(|err| format_err!("unable to create state dir {state_dir:?} - {err}"))?;

        let wal_path = state_dir.join(WAL_NAME);
        let snapshot_path = state_dir.join(SNAPSHOT_NAME);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)
            .map_err(|err| format_err!("unable to open WAL {wal_path:?} - {err}"))?;

        Ok(Self {
            wal_path,
            snapshot_path,
            file: Mutex::new(file),
        })
    }
}

impl MetaBackend for WalBackend {
    fn append(&self, event: &MetaEvent) -> Result<(), Error> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap();
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|err| format_err!("WAL append failed - {err}"))
    }

    fn load(&self) -> Result<(State, u64), Error> {
        let mut state = match std::fs::read(&self.snapshot_path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("corrupt snapshot {:?}", self.snapshot_path))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(err) => {
                return Err(format_err!(
                    "unable to read snapshot {:?} - {err}",
                    self.snapshot_path
                ))
            }
        };
        state.rebuild_indexes();

        let file = File::open(&self.wal_path)
            .map_err(|err| format_err!("unable to read WAL {:?} - {err}", self.wal_path))?;

        let mut replayed = 0u64;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: MetaEvent = serde_json::from_str(&line).with_context(|| {
                format!("corrupt WAL entry at {:?}:{}", self.wal_path, lineno + 1)
            })?;
            state.apply(&event);
            replayed += 1;
        }
        state.rebuild_indexes();

        Ok((state, replayed))
    }

    fn compact(&self, state: &State) -> Result<(), Error> {
        let data = serde_json::to_vec(state)?;
        sfs_tools::fs::replace_file(&self.snapshot_path, &data, true)?;

        // snapshot is durable, the journaled history can go
        let mut file = self.file.lock().unwrap();
        *file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|err| format_err!("unable to reset WAL {:?} - {err}", self.wal_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_api_types::{NodeRecord, NodeState};
    use uuid::Uuid;

    fn node_event(node_id: &str) -> MetaEvent {
        MetaEvent::Heartbeat {
            node: NodeRecord {
                node_id: node_id.to_string(),
                host: "127.0.0.1".to_string(),
                port: 9000,
                rack: None,
                free_space: 100,
                total_space: 200,
                chunk_count: 0,
                last_heartbeat: 1,
                state: NodeState::Active,
            },
            chunk_ids: vec![Uuid::new_v4()],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WalBackend::new(dir.path()).unwrap();

        backend.append(&node_event("w1")).unwrap();
        backend.append(&node_event("w2")).unwrap();

        let (state, replayed) = backend.load().unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(state.nodes.len(), 2);
        assert!(state.nodes.contains_key("w1"));
    }

    #[test]
    fn test_compact_resets_wal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WalBackend::new(dir.path()).unwrap();

        backend.append(&node_event("w1")).unwrap();
        let (state, replayed) = backend.load().unwrap();
        assert_eq!(replayed, 1);

        backend.compact(&state).unwrap();
        let (restored, replayed) = backend.load().unwrap();
        assert_eq!(replayed, 0);
        assert_eq!(restored.nodes.len(), 1);

        // appends after compaction land on the fresh WAL
        backend.append(&node_event("w2")).unwrap();
        let (latest, replayed) = backend.load().unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(latest.nodes.len(), 2);
    }

    #[test]
    fn test_load_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WalBackend::new(dir.path()).unwrap();
        let (state, replayed) = backend.load().unwrap();
        assert_eq!(replayed, 0);
        assert!(state.files.is_empty());
        assert!(state.nodes.is_empty());
    }
}
