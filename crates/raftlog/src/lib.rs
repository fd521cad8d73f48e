//! Segmented append-only log store for the replicated log.
//!
//! The log is a directory of segment files. Each segment carries a fixed
//! header naming the index of its first entry, and every entry is framed
//! with a checksummed header so recovery can detect torn writes.
//!
//! ## File Layout
//!
//! ```text
//! {data_dir}/log/
//! ├── 00000000000000000001.seg
//! ├── 00000000000000004097.seg
//! └── ...
//! ```
//!
//! ## Segment Format
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment header (36 bytes)          │
//! │ ├─ magic: u32 (0x52534547 "RSEG") │
//! │ ├─ version: u32                    │
//! │ ├─ first_index: u64                │
//! │ ├─ prev_term: u64                  │
//! │ ├─ max_entries: u32                │
//! │ └─ max_bytes: u64                  │
//! ├────────────────────────────────────┤
//! │ Entry header (28 bytes)            │
//! │ ├─ magic: u32 (0x454e5452 "ENTR") │
//! │ ├─ checksum: u32 (CRC32)          │
//! │ ├─ length: u32                     │
//! │ ├─ index: u64                      │
//! │ └─ term: u64                       │
//! ├────────────────────────────────────┤
//! │ Payload (bincode Entry)            │
//! ├────────────────────────────────────┤
//! │ ... more entries ...               │
//! └────────────────────────────────────┘
//! ```
//!
//! Writes are serialized through a single-writer lock acquired by
//! [`SegmentedLog::writer`]; readers share an in-memory index and never
//! take the writer lock. An append is either durable and visible or the
//! log is unchanged.


use common::{Entry, IndexedEntry, LogIndex, RaftError, RaftResult, Term};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Magic bytes opening every segment file: "RSEG" in ASCII.
const SEGMENT_MAGIC: u32 = 0x52534547;

/// Magic bytes opening every entry frame: "ENTR" in ASCII.
const ENTRY_MAGIC: u32 = 0x454e5452;

const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
const SEGMENT_HEADER_SIZE: usize = 36;

/// Size of the entry header in bytes.
const ENTRY_HEADER_SIZE: usize = 28;

/// Sizing knobs for log segments.
#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    /// Roll to a new segment after this many entries.
    pub max_segment_entries: u32,
    /// Roll to a new segment once the file would exceed this many bytes.
    pub max_segment_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_entries: 4096,
            max_segment_bytes: 32 * 1024 * 1024,
        }
    }
}

impl LogConfig {
    pub fn with_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    pub fn with_segment_entries(mut self, entries: u32) -> Self {
        self.max_segment_entries = entries;
        self
    }
}

/// Fixed header at the start of each segment file.
#[derive(Clone, Copy, Debug)]
struct SegmentHeader {
    first_index: LogIndex,
    /// Term of the entry immediately before `first_index` (0 at the log head).
    prev_term: Term,
    max_entries: u32,
    max_bytes: u64,
}

impl SegmentHeader {
    fn to_bytes(self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.prev_term.to_le_bytes());
        buf[24..28].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[28..36].copy_from_slice(&self.max_bytes.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; SEGMENT_HEADER_SIZE]) -> RaftResult<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(RaftError::Log("bad segment magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(RaftError::Log(format!(
                "unsupported segment version {}",
                version
            )));
        }
        Ok(Self {
            first_index: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            prev_term: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            max_entries: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            max_bytes: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
        })
    }
}

/// Fixed header preceding each entry payload.
#[derive(Clone, Copy, Debug)]
struct EntryHeader {
    checksum: u32,
    length: u32,
    index: LogIndex,
    term: Term,
}

impl EntryHeader {
    fn to_bytes(self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.term.to_le_bytes());
        buf
    }

    /// Returns `None` when the magic does not match (torn or foreign bytes).
    fn from_bytes(buf: &[u8; ENTRY_HEADER_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != ENTRY_MAGIC {
            return None;
        }
        Some(Self {
            checksum: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            index: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            term: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// Location of an entry frame on disk.
#[derive(Clone, Copy, Debug)]
struct EntryLocation {
    /// First index of the owning segment.
    segment: LogIndex,
    /// Byte offset of the frame within the segment file.
    offset: u64,
    /// Frame length including header. Kept for future direct reads.
    #[allow(dead_code)]
    length: u32,
}

/// Mutable state guarded by the writer lock.
struct WriterState {
    /// Open append handle on the newest segment.
    active: File,
    active_first: LogIndex,
    active_entries: u32,
    active_bytes: u64,
    /// All live segments: first index -> file path.
    segments: BTreeMap<LogIndex, PathBuf>,
    /// On-disk location of every live entry.
    locations: BTreeMap<LogIndex, EntryLocation>,
}

struct LogInner {
    dir: PathBuf,
    config: LogConfig,
    /// Full entry cache shared with readers.
    cache: RwLock<BTreeMap<LogIndex, IndexedEntry>>,
    writer: Mutex<WriterState>,
    commit_index: AtomicU64,
    last_index: AtomicU64,
    last_term: AtomicU64,
    /// Index below which entries no longer exist (snapshot boundary).
    reset_index: AtomicU64,
    reset_term: AtomicU64,
}

impl LogInner {
    fn read_cache(&self) -> RwLockReadGuard<'_, BTreeMap<LogIndex, IndexedEntry>> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, BTreeMap<LogIndex, IndexedEntry>> {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The segmented replicated log.
///
/// Cloning is cheap; all clones share the same underlying store.
#[derive(Clone)]
pub struct SegmentedLog {
    inner: Arc<LogInner>,
}

fn segment_path(dir: &Path, first_index: LogIndex) -> PathBuf {
    dir.join(format!("{:020}.seg", first_index))
}

fn encode_entry(entry: &Entry) -> RaftResult<Vec<u8>> {
    bincode::serde::encode_to_vec(entry, bincode::config::legacy())
        .map_err(|e| RaftError::Log(format!("failed to serialize entry: {}", e)))
}

fn decode_entry(payload: &[u8]) -> RaftResult<Entry> {
    bincode::serde::decode_from_slice(payload, bincode::config::legacy())
        .map(|(entry, _)| entry)
        .map_err(|e| RaftError::Log(format!("failed to deserialize entry: {}", e)))
}

/// Create a fresh segment file with its header written and synced.
fn create_segment(
    dir: &Path,
    first_index: LogIndex,
    prev_term: Term,
    config: &LogConfig,
) -> RaftResult<File> {
    let path = segment_path(dir, first_index);
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .append(true)
        .open(&path)
        .map_err(|e| RaftError::Log(format!("failed to create segment {:?}: {}", path, e)))?;

    let header = SegmentHeader {
        first_index,
        prev_term,
        max_entries: config.max_segment_entries,
        max_bytes: config.max_segment_bytes,
    };
    file.write_all(&header.to_bytes())
        .map_err(|e| RaftError::Log(format!("failed to write segment header: {}", e)))?;
    file.sync_all()
        .map_err(|e| RaftError::Log(format!("failed to sync segment: {}", e)))?;

    Ok(file)
}

impl SegmentedLog {
    /// Open or create a segmented log in the given directory.
    ///
    /// Recovery scans every segment in index order, validates entry magic
    /// and checksums, trims a torn tail from the newest segment, and
    /// rebuilds the in-memory index. An index gap between entries is a
    /// corruption error.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> RaftResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // Discover segments, ordered by first index.
        let mut segments: BTreeMap<LogIndex, PathBuf> = BTreeMap::new();
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().is_some_and(|ext| ext == "seg") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(first) = stem.parse::<u64>() {
                        segments.insert(first, path);
                    }
                }
            }
        }

        if segments.is_empty() {
            let active = create_segment(&dir, 1, 0, &config)?;
            segments.insert(1, segment_path(&dir, 1));
            let state = WriterState {
                active,
                active_first: 1,
                active_entries: 0,
                active_bytes: SEGMENT_HEADER_SIZE as u64,
                segments,
                locations: BTreeMap::new(),
            };
            return Ok(Self {
                inner: Arc::new(LogInner {
                    dir,
                    config,
                    cache: RwLock::new(BTreeMap::new()),
                    writer: Mutex::new(state),
                    commit_index: AtomicU64::new(0),
                    last_index: AtomicU64::new(0),
                    last_term: AtomicU64::new(0),
                    reset_index: AtomicU64::new(0),
                    reset_term: AtomicU64::new(0),
                }),
            });
        }

        let mut cache = BTreeMap::new();
        let mut locations = BTreeMap::new();

        let first_segment = *segments.keys().next().expect("segments nonempty");
        let newest_segment = *segments.keys().next_back().expect("segments nonempty");

        let mut reset_index = 0;
        let mut reset_term = 0;
        let mut last_index = 0;
        let mut last_term = 0;
        let mut active_entries = 0u32;
        let mut active_bytes = SEGMENT_HEADER_SIZE as u64;

        for (&first, path) in &segments {
            let file = File::open(path)
                .map_err(|e| RaftError::Log(format!("failed to open segment {:?}: {}", path, e)))?;
            let mut reader = BufReader::new(file);

            let mut header_buf = [0u8; SEGMENT_HEADER_SIZE];
            reader
                .read_exact(&mut header_buf)
                .map_err(|e| RaftError::Log(format!("failed to read segment header: {}", e)))?;
            let header = SegmentHeader::from_bytes(&header_buf)?;
            if header.first_index != first {
                return Err(RaftError::Log(format!(
                    "segment {:?} header index {} does not match filename",
                    path, header.first_index
                )));
            }

            if first == first_segment {
                reset_index = header.first_index.saturating_sub(1);
                reset_term = header.prev_term;
                last_index = reset_index;
                last_term = reset_term;
            }

            let is_newest = first == newest_segment;
            let mut offset = SEGMENT_HEADER_SIZE as u64;
            let mut entries_in_segment = 0u32;

            loop {
                let mut entry_buf = [0u8; ENTRY_HEADER_SIZE];
                match reader.read_exact(&mut entry_buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(RaftError::Log(format!("failed to read entry: {}", e))),
                }

                let Some(entry_header) = EntryHeader::from_bytes(&entry_buf) else {
                    if is_newest {
                        break;
                    }
                    return Err(RaftError::Log(format!(
                        "corrupt entry in segment {:?}",
                        path
                    )));
                };

                let mut payload = vec![0u8; entry_header.length as usize];
                if reader.read_exact(&mut payload).is_err() {
                    // Partial frame at the end of the newest segment.
                    if is_newest {
                        break;
                    }
                    return Err(RaftError::Log(format!(
                        "truncated entry in segment {:?}",
                        path
                    )));
                }

                if crc32fast::hash(&payload) != entry_header.checksum {
                    if is_newest {
                        break;
                    }
                    return Err(RaftError::Log(format!(
                        "checksum mismatch in segment {:?}",
                        path
                    )));
                }

                if entry_header.index != last_index + 1 {
                    return Err(RaftError::Log(format!(
                        "index gap: expected {}, found {}",
                        last_index + 1,
                        entry_header.index
                    )));
                }

                let entry = decode_entry(&payload)?;
                let frame_len = ENTRY_HEADER_SIZE as u32 + entry_header.length;
                locations.insert(
                    entry_header.index,
                    EntryLocation {
                        segment: first,
                        offset,
                        length: frame_len,
                    },
                );
                cache.insert(
                    entry_header.index,
                    IndexedEntry::new(
                        entry_header.index,
                        entry_header.term,
                        entry,
                        entry_header.length,
                    ),
                );

                last_index = entry_header.index;
                last_term = entry_header.term;
                offset += frame_len as u64;
                entries_in_segment += 1;
            }

            if is_newest {
                // Drop any torn bytes past the last valid frame.
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                active_entries = entries_in_segment;
                active_bytes = offset;
            }
        }

        let active_path = segments.get(&newest_segment).expect("newest segment exists");
        let active = OpenOptions::new()
            .read(true)
            .append(true)
            .open(active_path)
            .map_err(|e| RaftError::Log(format!("failed to open active segment: {}", e)))?;

        let state = WriterState {
            active,
            active_first: newest_segment,
            active_entries,
            active_bytes,
            segments,
            locations,
        };

        Ok(Self {
            inner: Arc::new(LogInner {
                dir,
                config,
                cache: RwLock::new(cache),
                writer: Mutex::new(state),
                commit_index: AtomicU64::new(0),
                last_index: AtomicU64::new(last_index),
                last_term: AtomicU64::new(last_term),
                reset_index: AtomicU64::new(reset_index),
                reset_term: AtomicU64::new(reset_term),
            }),
        })
    }

    /// Acquire the single-writer lock. Dropping the returned writer
    /// releases it.
    pub fn writer(&self) -> LogWriter<'_> {
        let guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        LogWriter {
            inner: &self.inner,
            state: guard,
        }
    }

    /// A shared reader over the log. Readers never block the writer.
    pub fn reader(&self) -> LogReader {
        LogReader {
            inner: Arc::clone(&self.inner),
            next: 1,
        }
    }

    /// Fetch the entry at `index`, if present.
    pub fn get(&self, index: LogIndex) -> Option<IndexedEntry> {
        self.inner.read_cache().get(&index).cloned()
    }

    /// The index of the last entry, or the snapshot boundary when empty.
    pub fn last_index(&self) -> LogIndex {
        self.inner.last_index.load(Ordering::SeqCst)
    }

    /// The term of the last entry.
    pub fn last_term(&self) -> Term {
        self.inner.last_term.load(Ordering::SeqCst)
    }

    /// The index of the first live entry (1 on a log that was never reset).
    pub fn first_index(&self) -> LogIndex {
        self.inner.reset_index.load(Ordering::SeqCst) + 1
    }

    /// The term of the entry at `index`, consulting the snapshot boundary
    /// for indexes the log no longer holds. Index 0 has term 0.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(e) = self.get(index) {
            return Some(e.term);
        }
        let reset_index = self.inner.reset_index.load(Ordering::SeqCst);
        (index == reset_index).then(|| self.inner.reset_term.load(Ordering::SeqCst))
    }

    /// Record the highest index known committed. Monotonic.
    pub fn set_commit_index(&self, index: LogIndex) {
        self.inner.commit_index.fetch_max(index, Ordering::SeqCst);
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.commit_index.load(Ordering::SeqCst)
    }
}

/// Exclusive write access to the log. Holding this guard is the writer lock.
pub struct LogWriter<'a> {
    inner: &'a LogInner,
    state: MutexGuard<'a, WriterState>,
}

impl LogWriter<'_> {
    pub fn last_index(&self) -> LogIndex {
        self.inner.last_index.load(Ordering::SeqCst)
    }

    pub fn last_term(&self) -> Term {
        self.inner.last_term.load(Ordering::SeqCst)
    }

    fn reset_point(&self) -> (LogIndex, Term) {
        (
            self.inner.reset_index.load(Ordering::SeqCst),
            self.inner.reset_term.load(Ordering::SeqCst),
        )
    }

    /// Append an entry at the next index in the given term.
    pub fn append(&mut self, term: Term, entry: Entry) -> RaftResult<IndexedEntry> {
        let index = self.last_index() + 1;
        let size = self.write_entry(index, term, &entry)?;
        Ok(IndexedEntry::new(index, term, entry, size))
    }

    /// Append an entry that already carries its index, as received from a
    /// leader. The index must be exactly one past the current last index.
    pub fn append_indexed(&mut self, entry: &IndexedEntry) -> RaftResult<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::Log(format!(
                "append at index {} would leave a gap (next is {})",
                entry.index, expected
            )));
        }
        self.write_entry(entry.index, entry.term, &entry.entry)?;
        Ok(())
    }

    /// Reconcile a replicated entry against the local log, enforcing the
    /// Log Matching property. Returns `true` when bytes were written.
    ///
    /// - Same `(index, term)` already present: no write.
    /// - Conflicting term at the index: truncate to `index - 1`, then append.
    /// - Absent: append (the index must be contiguous).
    pub fn reconcile(&mut self, entry: &IndexedEntry) -> RaftResult<bool> {
        let existing_term = self.inner.read_cache().get(&entry.index).map(|e| e.term);
        match existing_term {
            Some(term) if term == entry.term => Ok(false),
            Some(_) => {
                self.truncate(entry.index - 1)?;
                self.append_indexed(entry)?;
                Ok(true)
            }
            None => {
                self.append_indexed(entry)?;
                Ok(true)
            }
        }
    }

    /// Discard all entries with index greater than `index`.
    ///
    /// Truncation is durable: the containing segment file is shrunk and any
    /// later segments are deleted before the call returns.
    pub fn truncate(&mut self, index: LogIndex) -> RaftResult<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        let (reset_index, reset_term) = self.reset_point();
        if index < reset_index {
            return Err(RaftError::Log(format!(
                "cannot truncate to {}: log starts after snapshot at {}",
                index, reset_index
            )));
        }

        // Delete segments that start past the truncation point.
        let doomed: Vec<LogIndex> = self
            .state
            .segments
            .range(index + 1..)
            .map(|(first, _)| *first)
            .collect();
        for first in doomed {
            if let Some(path) = self.state.segments.remove(&first) {
                fs::remove_file(&path).map_err(|e| {
                    RaftError::Log(format!("failed to remove segment {:?}: {}", path, e))
                })?;
            }
        }

        if self.state.segments.is_empty() {
            // Everything is gone; start over at the snapshot boundary.
            let first = reset_index + 1;
            let active = create_segment(&self.inner.dir, first, reset_term, &self.inner.config)?;
            self.state
                .segments
                .insert(first, segment_path(&self.inner.dir, first));
            self.state.active = active;
            self.state.active_first = first;
            self.state.active_entries = 0;
            self.state.active_bytes = SEGMENT_HEADER_SIZE as u64;
        } else {
            // Shrink the segment that now holds the tail.
            let (seg_first, path) = {
                let (k, v) = self
                    .state
                    .segments
                    .iter()
                    .next_back()
                    .expect("segments nonempty");
                (*k, v.clone())
            };
            let cut = self
                .state
                .locations
                .get(&(index + 1))
                .filter(|loc| loc.segment == seg_first)
                .map(|loc| loc.offset);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    RaftError::Log(format!("failed to reopen segment {:?}: {}", path, e))
                })?;
            if let Some(offset) = cut {
                file.set_len(offset)?;
            }
            file.sync_all()?;
            let len = file.metadata()?.len();
            self.state.active = OpenOptions::new().read(true).append(true).open(&path)?;
            self.state.active_first = seg_first;
            self.state.active_bytes = len;
            self.state.active_entries = (index + 1).saturating_sub(seg_first) as u32;
        }

        // Drop the in-memory view of everything past the cut.
        let stale: Vec<LogIndex> = self
            .state
            .locations
            .range(index + 1..)
            .map(|(i, _)| *i)
            .collect();
        {
            let mut cache = self.inner.write_cache();
            for i in &stale {
                self.state.locations.remove(i);
                cache.remove(i);
            }
        }

        let last_term = if index == reset_index {
            reset_term
        } else {
            self.inner
                .read_cache()
                .get(&index)
                .map(|e| e.term)
                .unwrap_or(0)
        };
        self.inner.last_index.store(index, Ordering::SeqCst);
        self.inner.last_term.store(last_term, Ordering::SeqCst);

        Ok(())
    }

    /// Wipe the log and restart it just past `index`, recording `term` as
    /// the term at the new boundary. Used after a snapshot install makes
    /// the existing entries obsolete.
    pub fn reset(&mut self, index: LogIndex, term: Term) -> RaftResult<()> {
        for path in self.state.segments.values() {
            fs::remove_file(path).map_err(|e| {
                RaftError::Log(format!("failed to remove segment {:?}: {}", path, e))
            })?;
        }
        self.state.segments.clear();
        self.state.locations.clear();
        self.inner.write_cache().clear();

        let first = index + 1;
        let active = create_segment(&self.inner.dir, first, term, &self.inner.config)?;
        self.state
            .segments
            .insert(first, segment_path(&self.inner.dir, first));
        self.state.active = active;
        self.state.active_first = first;
        self.state.active_entries = 0;
        self.state.active_bytes = SEGMENT_HEADER_SIZE as u64;
        self.inner.last_index.store(index, Ordering::SeqCst);
        self.inner.last_term.store(term, Ordering::SeqCst);
        self.inner.reset_index.store(index, Ordering::SeqCst);
        self.inner.reset_term.store(term, Ordering::SeqCst);

        Ok(())
    }

    /// Roll to a fresh segment if the active one is at capacity.
    fn maybe_roll(&mut self, frame_len: u64) -> RaftResult<()> {
        let full = self.state.active_entries >= self.inner.config.max_segment_entries
            || self.state.active_bytes + frame_len > self.inner.config.max_segment_bytes;
        if !full || self.state.active_entries == 0 {
            return Ok(());
        }

        let first = self.last_index() + 1;
        let active = create_segment(&self.inner.dir, first, self.last_term(), &self.inner.config)?;
        self.state
            .segments
            .insert(first, segment_path(&self.inner.dir, first));
        self.state.active = active;
        self.state.active_first = first;
        self.state.active_entries = 0;
        self.state.active_bytes = SEGMENT_HEADER_SIZE as u64;
        Ok(())
    }

    /// Write one frame, returning the payload size in bytes.
    fn write_entry(&mut self, index: LogIndex, term: Term, entry: &Entry) -> RaftResult<u32> {
        let payload = encode_entry(entry)?;
        let frame_len = (ENTRY_HEADER_SIZE + payload.len()) as u64;
        self.maybe_roll(frame_len)?;

        let header = EntryHeader {
            checksum: crc32fast::hash(&payload),
            length: payload.len() as u32,
            index,
            term,
        };

        let offset = self.state.active_bytes;
        self.state
            .active
            .write_all(&header.to_bytes())
            .map_err(|e| RaftError::Log(format!("failed to write entry header: {}", e)))?;
        self.state
            .active
            .write_all(&payload)
            .map_err(|e| RaftError::Log(format!("failed to write entry payload: {}", e)))?;
        self.state
            .active
            .sync_all()
            .map_err(|e| RaftError::Log(format!("failed to sync entry: {}", e)))?;

        // Only now, with the bytes durable, publish the entry.
        let active_first = self.state.active_first;
        self.state.locations.insert(
            index,
            EntryLocation {
                segment: active_first,
                offset,
                length: frame_len as u32,
            },
        );
        self.inner.write_cache().insert(
            index,
            IndexedEntry::new(index, term, entry.clone(), payload.len() as u32),
        );
        self.state.active_entries += 1;
        self.state.active_bytes += frame_len;
        self.inner.last_index.store(index, Ordering::SeqCst);
        self.inner.last_term.store(term, Ordering::SeqCst);

        Ok(payload.len() as u32)
    }
}

/// A shared, forward-iterating view of the log.
pub struct LogReader {
    inner: Arc<LogInner>,
    next: LogIndex,
}

impl LogReader {
    /// Fetch the entry at `index` without moving the cursor.
    pub fn get(&self, index: LogIndex) -> Option<IndexedEntry> {
        self.inner.read_cache().get(&index).cloned()
    }

    /// Position the cursor so the next read returns `index`.
    pub fn seek(&mut self, index: LogIndex) {
        self.next = index;
    }

    /// Read the entry under the cursor and advance.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<IndexedEntry> {
        let entry = self.inner.read_cache().get(&self.next).cloned()?;
        self.next += 1;
        Some(entry)
    }

    /// Read the next entry only if it is at or below the commit index.
    pub fn next_committed(&mut self) -> Option<IndexedEntry> {
        if self.next > self.inner.commit_index.load(Ordering::SeqCst) {
            return None;
        }
        self.next()
    }

    /// Collect the entries in `[from, to]`, stopping at the first absent
    /// index.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<IndexedEntry> {
        let cache = self.inner.read_cache();
        let mut out = Vec::new();
        for index in from..=to {
            match cache.get(&index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        out
    }
}
