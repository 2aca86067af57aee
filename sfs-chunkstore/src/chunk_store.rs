use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ChunkStoreError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

const CHUNK_SUFFIX: &str = ".chunk";
const SIDECAR_SUFFIX: &str = ".sha256";
const BAD_SUFFIX: &str = ".bad";

/// Result of a scrub pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScrubStats {
    pub checked: usize,
    pub quarantined: usize,
}

/// File system based chunk store.
///
/// The in-memory inventory is updated on every successful mutation and
/// rebuilt by [`ChunkStore::rescan`]; only chunks with a valid sidecar are
/// ever reported.
pub struct ChunkStore {
    base: PathBuf,
    // chunk id -> byte size recorded at write time; doubles as the
    // lightweight lock serializing directory mutations
    inventory: Mutex<HashMap<Uuid, u64>>,
}

/// Streaming writer for one incoming chunk. Bytes go to a temp file while
/// the digest is computed incrementally; nothing becomes visible before
/// [`ChunkStore::finish_writer`].
pub struct ChunkWriter {
    chunk_id: Uuid,
    tmp_path: PathBuf,
    file: File,
    hasher: Sha256,
    size: u64,
}

impl ChunkWriter {
    pub fn write(&mut self, data: &[u8]) -> Result<(), ChunkStoreError> {
        self.file.write_all(data).map_err(ChunkStoreError::from_io)?;
        self.hasher.update(data);
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn chunk_id(&self) -> Uuid {
        self.chunk_id
    }

    /// Drops the temp file; the store is left exactly as before.
    pub fn abort(self) {
        drop(self.file);
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

impl ChunkStore {
    pub fn open<P: Into<PathBuf>>(base: P) -> Result<Self, ChunkStoreError> {
        let base: PathBuf = base.into();
        std::fs::create_dir_all(&base)?;

        let store = Self {
            base,
            inventory: Mutex::new(HashMap::new()),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn chunk_path(&self, chunk_id: Uuid) -> PathBuf {
        self.base.join(format!("{chunk_id}{CHUNK_SUFFIX}"))
    }

    pub fn sidecar_path(&self, chunk_id: Uuid) -> PathBuf {
        self.base.join(format!("{chunk_id}{SIDECAR_SUFFIX}"))
    }

    pub fn contains(&self, chunk_id: Uuid) -> bool {
        self.inventory.lock().unwrap().contains_key(&chunk_id)
    }

    pub fn chunk_count(&self) -> u64 {
        self.inventory.lock().unwrap().len() as u64
    }

    /// Current inventory snapshot, the payload of every heartbeat.
    pub fn inventory(&self) -> Vec<Uuid> {
        self.inventory.lock().unwrap().keys().copied().collect()
    }

    /// Size recorded when the chunk was written, if present.
    pub fn chunk_size(&self, chunk_id: Uuid) -> Option<u64> {
        self.inventory.lock().unwrap().get(&chunk_id).copied()
    }

    /// Free and total bytes of the file system holding the store.
    pub fn usage(&self) -> Result<(u64, u64), ChunkStoreError> {
        let stat = nix::sys::statvfs::statvfs(&self.base)
            .map_err(|err| ChunkStoreError::Io(std::io::Error::from(err)))?;
        let frag = stat.fragment_size() as u64;
        Ok((
            stat.blocks_available() as u64 * frag,
            stat.blocks() as u64 * frag,
        ))
    }

    pub fn create_writer(&self, chunk_id: Uuid) -> Result<ChunkWriter, ChunkStoreError> {
        let tmp_path = self.base.join(format!(
            "{chunk_id}{CHUNK_SUFFIX}.tmp_{}_{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        let file = File::create(&tmp_path).map_err(ChunkStoreError::from_io)?;
        Ok(ChunkWriter {
            chunk_id,
            tmp_path,
            file,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Fsync, publish the body, then the sidecar. Chunks are immutable: if
    /// the id landed meanwhile, the incoming bytes are discarded and the
    /// stored digest wins.
    pub fn finish_writer(&self, writer: ChunkWriter) -> Result<(u64, String), ChunkStoreError> {
        let ChunkWriter {
            chunk_id,
            tmp_path,
            file,
            hasher,
            size,
        } = writer;

        file.sync_all().map_err(ChunkStoreError::from_io)?;
        drop(file);

        let digest = hex::encode(hasher.finalize());
        let chunk_path = self.chunk_path(chunk_id);
        let sidecar_path = self.sidecar_path(chunk_id);

        let mut inventory = self.inventory.lock().unwrap();

        if let Some(existing) = self.read_sidecar(chunk_id)? {
            let _ = std::fs::remove_file(&tmp_path);
            let existing_size = std::fs::metadata(&chunk_path)?.len();
            if existing != digest {
                log::warn!(
                    "chunk {chunk_id}: discarding upload with different content (kept {existing})"
                );
            }
            inventory.insert(chunk_id, existing_size);
            return Ok((existing_size, existing));
        }

        std::fs::rename(&tmp_path, &chunk_path).map_err(|err| {
            let _ = std::fs::remove_file(&tmp_path);
            ChunkStoreError::from_io(err)
        })?;
        self.write_sidecar(&sidecar_path, &digest)
            .map_err(ChunkStoreError::from_io)?;

        inventory.insert(chunk_id, size);

        Ok((size, digest))
    }

    /// Buffered insert used by tests and the replication receive path.
    pub fn insert_chunk(&self, chunk_id: Uuid, data: &[u8]) -> Result<(u64, String), ChunkStoreError> {
        let mut writer = self.create_writer(chunk_id)?;
        writer.write(data)?;
        self.finish_writer(writer)
    }

    /// Digest of a stored chunk, or `None` if the pair is not complete.
    pub fn stored_digest(&self, chunk_id: Uuid) -> Result<Option<String>, ChunkStoreError> {
        if !self.chunk_path(chunk_id).is_file() {
            return Ok(None);
        }
        self.read_sidecar(chunk_id)
    }

    /// Reads a chunk and verifies it against its sidecar. A mismatch
    /// quarantines the pair and fails - corrupt bytes are never returned.
    pub fn read_chunk(&self, chunk_id: Uuid) -> Result<(Vec<u8>, String), ChunkStoreError> {
        let stored = self
            .read_sidecar(chunk_id)?
            .ok_or(ChunkStoreError::NotFound(chunk_id))?;

        let data = match std::fs::read(self.chunk_path(chunk_id)) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChunkStoreError::NotFound(chunk_id));
            }
            Err(err) => return Err(ChunkStoreError::from_io(err)),
        };

        let computed = hex::encode(Sha256::digest(&data));
        if computed != stored {
            self.quarantine(chunk_id);
            return Err(ChunkStoreError::Corrupted {
                chunk_id,
                stored,
                computed,
            });
        }

        Ok((data, computed))
    }

    /// Removes both files; repeat calls are a no-op.
    pub fn remove_chunk(&self, chunk_id: Uuid) -> Result<(), ChunkStoreError> {
        let mut inventory = self.inventory.lock().unwrap();
        for path in [self.chunk_path(chunk_id), self.sidecar_path(chunk_id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => return Err(ChunkStoreError::from_io(err)),
            }
        }
        inventory.remove(&chunk_id);
        Ok(())
    }

    /// Renames the pair with a `.bad` suffix so the inventory stops
    /// reporting it. The files stay around for inspection.
    pub fn quarantine(&self, chunk_id: Uuid) {
        log::error!("chunk {chunk_id} failed verification, quarantining");
        for path in [self.chunk_path(chunk_id), self.sidecar_path(chunk_id)] {
            let mut bad = path.as_os_str().to_owned();
            bad.push(BAD_SUFFIX);
            if let Err(err) = std::fs::rename(&path, &bad) {
                log::error!("unable to quarantine {path:?} - {err}");
            }
        }
        self.inventory.lock().unwrap().remove(&chunk_id);
    }

    /// Full directory scan rebuilding the inventory. Bodies without a valid
    /// sidecar and quarantined pairs are skipped.
    pub fn rescan(&self) -> Result<usize, ChunkStoreError> {
        let mut found = HashMap::new();

        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let stem = match name.strip_suffix(CHUNK_SUFFIX) {
                Some(stem) => stem,
                None => continue,
            };
            let chunk_id = match Uuid::parse_str(stem) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if self.read_sidecar(chunk_id)?.is_none() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            found.insert(chunk_id, meta.len());
        }

        let count = found.len();
        *self.inventory.lock().unwrap() = found;
        Ok(count)
    }

    /// Re-reads every chunk to catch bit-rot; bad pairs are quarantined and
    /// disappear from the next heartbeat.
    pub fn scrub(&self) -> ScrubStats {
        let mut stats = ScrubStats::default();
        for chunk_id in self.inventory() {
            match self.read_chunk(chunk_id) {
                Ok(_) => stats.checked += 1,
                Err(ChunkStoreError::Corrupted { .. }) => {
                    stats.checked += 1;
                    stats.quarantined += 1;
                }
                // deleted under our feet or transient read failure
                Err(err) => log::warn!("scrub: unable to read chunk {chunk_id} - {err}"),
            }
        }
        stats
    }

    fn read_sidecar(&self, chunk_id: Uuid) -> Result<Option<String>, ChunkStoreError> {
        match std::fs::read_to_string(self.sidecar_path(chunk_id)) {
            Ok(content) => {
                let digest = content.trim().to_string();
                if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    Ok(Some(digest))
                } else {
                    Ok(None)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ChunkStoreError::from_io(err)),
        }
    }

    fn write_sidecar(&self, path: &Path, digest: &str) -> std::io::Result<()> {
        let tmp = PathBuf::from(format!(
            "{}.tmp_{}",
            path.display(),
            std::process::id()
        ));
        let mut file = File::create(&tmp)?;
        file.write_all(digest.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_and_read() {
        let (_dir, store) = test_store();
        let id = Uuid::new_v4();

        let (size, digest) = store.insert_chunk(id, b"hello chunk").unwrap();
        assert_eq!(size, 11);
        assert!(store.contains(id));

        let (data, read_digest) = store.read_chunk(id).unwrap();
        assert_eq!(data, b"hello chunk");
        assert_eq!(digest, read_digest);
        assert_eq!(store.stored_digest(id).unwrap(), Some(digest));
    }

    #[test]
    fn test_repeated_put_is_idempotent() {
        let (_dir, store) = test_store();
        let id = Uuid::new_v4();

        let (_, first) = store.insert_chunk(id, b"original").unwrap();
        let (_, second) = store.insert_chunk(id, b"original").unwrap();
        assert_eq!(first, second);

        // chunks are immutable - differing bytes are discarded
        let (size, third) = store.insert_chunk(id, b"different bytes").unwrap();
        assert_eq!(third, first);
        assert_eq!(size, 8);
        assert_eq!(store.read_chunk(id).unwrap().0, b"original");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, store) = test_store();
        let id = Uuid::new_v4();

        store.insert_chunk(id, b"bytes").unwrap();
        store.remove_chunk(id).unwrap();
        store.remove_chunk(id).unwrap();
        assert!(!store.contains(id));
        assert!(matches!(
            store.read_chunk(id),
            Err(ChunkStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_corruption_is_quarantined() {
        let (dir, store) = test_store();
        let id = Uuid::new_v4();

        store.insert_chunk(id, b"precious data").unwrap();
        std::fs::write(store.chunk_path(id), b"flipped bits").unwrap();

        assert!(matches!(
            store.read_chunk(id),
            Err(ChunkStoreError::Corrupted { .. })
        ));
        assert!(!store.contains(id));

        // quarantined files keep the .bad suffix, rescan ignores them
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with(".chunk.bad")));
        assert_eq!(store.rescan().unwrap(), 0);
    }

    #[test]
    fn test_rescan_skips_incomplete_pairs() {
        let (_dir, store) = test_store();
        let with_sidecar = Uuid::new_v4();
        let without_sidecar = Uuid::new_v4();

        store.insert_chunk(with_sidecar, b"complete").unwrap();
        std::fs::write(store.chunk_path(without_sidecar), b"orphan body").unwrap();

        assert_eq!(store.rescan().unwrap(), 1);
        assert!(store.contains(with_sidecar));
        assert!(!store.contains(without_sidecar));
    }

    #[test]
    fn test_scrub_finds_bit_rot() {
        let (_dir, store) = test_store();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();

        store.insert_chunk(good, b"good bytes").unwrap();
        store.insert_chunk(bad, b"soon rotten").unwrap();
        std::fs::write(store.chunk_path(bad), b"rotten bytes").unwrap();

        let stats = store.scrub();
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.quarantined, 1);
        assert!(store.contains(good));
        assert!(!store.contains(bad));
    }

    #[test]
    fn test_writer_abort_leaves_no_trace() {
        let (dir, store) = test_store();
        let id = Uuid::new_v4();

        let mut writer = store.create_writer(id).unwrap();
        writer.write(b"half a chunk").unwrap();
        writer.abort();

        assert!(!store.contains(id));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
