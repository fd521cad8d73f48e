//! Content-addressed snapshot store with a staged write lifecycle.
//!
//! Snapshots are keyed by `(id, index)` and move through
//! `Pending -> Persisted -> Complete`; any state can drop to `Deleted` on
//! abort. Bytes are staged into a `.tmp` file, made durable by `persist`,
//! and published atomically by `complete`, which renames the staged file
//! into place and supersedes earlier completes for the same id.
//!
//! ## File Layout
//!
//! ```text
//! {data_dir}/snapshots/
//! ├── 00000000000000000042-00000000000000000100.snapshot
//! └── 00000000000000000042-00000000000000000230.snapshot.tmp   # staged
//! ```
//!
//! A snapshot that has not completed is invisible to readers: `get_snapshot`
//! only ever returns the highest-index `Complete` snapshot for an id.


use common::{LogIndex, RaftError, RaftResult};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Lifecycle status of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Created; bytes may still be in flight.
    Pending,
    /// Bytes are durable but the snapshot is not yet visible.
    Persisted,
    /// Published as the canonical snapshot for its id.
    Complete,
    /// Aborted; files removed.
    Deleted,
}

struct StoreInner {
    dir: PathBuf,
    /// Complete snapshots: id -> index -> file path.
    complete: RwLock<BTreeMap<u64, BTreeMap<LogIndex, PathBuf>>>,
}

impl StoreInner {
    fn final_path(&self, id: u64, index: LogIndex) -> PathBuf {
        self.dir.join(format!("{:020}-{:020}.snapshot", id, index))
    }

    fn staged_path(&self, id: u64, index: LogIndex) -> PathBuf {
        self.dir
            .join(format!("{:020}-{:020}.snapshot.tmp", id, index))
    }
}

/// The snapshot store for one server.
///
/// Cloning is cheap; all clones share the same directory and registry.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

/// Parse `(id, index)` out of a snapshot file stem.
fn parse_stem(stem: &str) -> Option<(u64, LogIndex)> {
    let (id, index) = stem.split_once('-')?;
    Some((id.parse().ok()?, index.parse().ok()?))
}

impl SnapshotStore {
    /// Open or create a snapshot store in the given directory.
    ///
    /// Complete snapshots are rediscovered from their filenames; staged
    /// `.tmp` files left behind by a crash are removed.
    pub fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut complete: BTreeMap<u64, BTreeMap<LogIndex, PathBuf>> = BTreeMap::new();
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".snapshot") {
                if let Some((id, index)) = parse_stem(stem) {
                    complete.entry(id).or_default().insert(index, path);
                }
            } else if name.ends_with(".snapshot.tmp") {
                // Abandoned staging file from a previous run.
                fs::remove_file(&path)?;
            }
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                complete: RwLock::new(complete),
            }),
        })
    }

    /// Begin a new snapshot at `(id, index)`. The returned handle is in
    /// `Pending` state and invisible to readers until completed.
    pub fn create_snapshot(&self, id: u64, index: LogIndex) -> RaftResult<Snapshot> {
        let staged = self.inner.staged_path(id, index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staged)
            .map_err(|e| {
                RaftError::Snapshot(format!("failed to stage snapshot {:?}: {}", staged, e))
            })?;

        Ok(Snapshot {
            inner: Arc::new(SnapshotInner {
                id,
                index,
                store: Arc::clone(&self.inner),
                state: Mutex::new(SnapshotState {
                    status: SnapshotStatus::Pending,
                    file: Some(file),
                }),
            }),
        })
    }

    /// The canonical (highest-index complete) snapshot for `id`, if any.
    pub fn get_snapshot(&self, id: u64) -> Option<Snapshot> {
        let complete = self
            .inner
            .complete
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (&index, _) = complete.get(&id)?.iter().next_back()?;
        Some(Snapshot {
            inner: Arc::new(SnapshotInner {
                id,
                index,
                store: Arc::clone(&self.inner),
                state: Mutex::new(SnapshotState {
                    status: SnapshotStatus::Complete,
                    file: None,
                }),
            }),
        })
    }

    /// The canonical snapshot with the highest index across all ids.
    pub fn latest(&self) -> Option<Snapshot> {
        let complete = self
            .inner
            .complete
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (&id, _) = complete
            .iter()
            .max_by_key(|(_, by_index)| by_index.keys().next_back().copied().unwrap_or(0))?;
        drop(complete);
        self.get_snapshot(id)
    }
}

struct SnapshotState {
    status: SnapshotStatus,
    /// Open staging handle while pending/persisted.
    file: Option<File>,
}

struct SnapshotInner {
    id: u64,
    index: LogIndex,
    store: Arc<StoreInner>,
    state: Mutex<SnapshotState>,
}

/// A handle to one snapshot at a fixed `(id, index)`.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn index(&self) -> LogIndex {
        self.inner.index
    }

    pub fn status(&self) -> SnapshotStatus {
        self.lock().status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapshotState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a scoped writer onto the staged bytes. The writer flushes when
    /// dropped, so release is guaranteed even on early return.
    pub fn writer(&self) -> RaftResult<SnapshotWriter<'_>> {
        let state = self.lock();
        match state.status {
            SnapshotStatus::Pending => Ok(SnapshotWriter { state }),
            status => Err(RaftError::Snapshot(format!(
                "cannot write snapshot ({},{}) in state {:?}",
                self.inner.id, self.inner.index, status
            ))),
        }
    }

    /// Make the staged bytes durable.
    pub fn persist(&self) -> RaftResult<()> {
        let mut state = self.lock();
        match state.status {
            SnapshotStatus::Pending => {
                if let Some(file) = state.file.as_mut() {
                    file.flush()?;
                    file.sync_all()?;
                }
                state.status = SnapshotStatus::Persisted;
                Ok(())
            }
            SnapshotStatus::Persisted => Ok(()),
            status => Err(RaftError::Snapshot(format!(
                "cannot persist snapshot ({},{}) in state {:?}",
                self.inner.id, self.inner.index, status
            ))),
        }
    }

    /// Publish this snapshot as the canonical one for its id.
    ///
    /// The staged file is renamed into place and the directory fsynced, so
    /// the publication is atomic with respect to crashes. Earlier complete
    /// snapshots for the same id are superseded and their files removed.
    pub fn complete(&self) -> RaftResult<()> {
        let mut state = self.lock();
        match state.status {
            SnapshotStatus::Persisted => {}
            SnapshotStatus::Complete => return Ok(()),
            status => {
                return Err(RaftError::Snapshot(format!(
                    "cannot complete snapshot ({},{}) in state {:?}",
                    self.inner.id, self.inner.index, status
                )))
            }
        }

        let store = &self.inner.store;
        let staged = store.staged_path(self.inner.id, self.inner.index);
        let path = store.final_path(self.inner.id, self.inner.index);

        state.file = None; // release the staging handle before the rename
        fs::rename(&staged, &path)
            .map_err(|e| RaftError::Snapshot(format!("failed to publish snapshot: {}", e)))?;
        let dir = File::open(&store.dir)?;
        dir.sync_all()?;

        let mut complete = store
            .complete
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let by_index = complete.entry(self.inner.id).or_default();
        // Supersede lower-index completes for this id.
        let superseded: Vec<LogIndex> = by_index
            .range(..self.inner.index)
            .map(|(&i, _)| i)
            .collect();
        for index in superseded {
            if let Some(old) = by_index.remove(&index) {
                let _ = fs::remove_file(old);
            }
        }
        by_index.insert(self.inner.index, path);

        state.status = SnapshotStatus::Complete;
        Ok(())
    }

    /// Release any open file handle without changing visibility.
    pub fn close(&self) {
        self.lock().file = None;
    }

    /// Abort: remove this snapshot's files and deregister it.
    pub fn delete(&self) -> RaftResult<()> {
        let mut state = self.lock();
        state.file = None;

        let store = &self.inner.store;
        let staged = store.staged_path(self.inner.id, self.inner.index);
        if staged.exists() {
            fs::remove_file(&staged)?;
        }

        if state.status == SnapshotStatus::Complete {
            let mut complete = store
                .complete
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(by_index) = complete.get_mut(&self.inner.id) {
                if let Some(path) = by_index.remove(&self.inner.index) {
                    let _ = fs::remove_file(path);
                }
                if by_index.is_empty() {
                    complete.remove(&self.inner.id);
                }
            }
        }

        state.status = SnapshotStatus::Deleted;
        Ok(())
    }

    /// Read the snapshot bytes. Only valid once complete.
    pub fn data(&self) -> RaftResult<Vec<u8>> {
        let status = self.status();
        if status != SnapshotStatus::Complete {
            return Err(RaftError::Snapshot(format!(
                "snapshot ({},{}) is not complete ({:?})",
                self.inner.id, self.inner.index, status
            )));
        }
        let path = self
            .inner
            .store
            .final_path(self.inner.id, self.inner.index);
        fs::read(&path)
            .map_err(|e| RaftError::Snapshot(format!("failed to read snapshot {:?}: {}", path, e)))
    }
}

/// Scoped writer over a staged snapshot. Flushes on drop.
pub struct SnapshotWriter<'a> {
    state: std::sync::MutexGuard<'a, SnapshotState>,
}

impl SnapshotWriter<'_> {
    /// Append a chunk of snapshot bytes.
    pub fn write(&mut self, data: &[u8]) -> RaftResult<()> {
        let file = self
            .state
            .file
            .as_mut()
            .ok_or_else(|| RaftError::Snapshot("snapshot staging file is closed".into()))?;
        file.write_all(data)
            .map_err(|e| RaftError::Snapshot(format!("failed to write snapshot chunk: {}", e)))?;
        Ok(())
    }
}

impl Drop for SnapshotWriter<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.state.file.as_mut() {
            let _ = file.flush();
        }
    }
}
