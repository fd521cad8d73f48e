//! Shared types for the replication core: identifiers, the log entry model,
//! the canonical error enum, and the bootstrap server configuration.
//!
//! Every other crate in the workspace builds on these definitions, so this
//! crate stays dependency-light: serde for persistence and wire visibility,
//! thiserror for the error enum, and nothing heavier.


use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{fmt, io, path::PathBuf, str::FromStr};
use thiserror::Error;

/// Identifier for a server in the cluster.
/// Examples:
/// - `let bootstrap: NodeId = 1;`
/// - `let observer: NodeId = 7;`
pub type NodeId = u64;

/// Raft term: a logical clock incremented at each election attempt.
/// Monotonically nondecreasing on every server.
pub type Term = u64;

/// Position of an entry in the replicated log. 1-based and dense;
/// 0 means "no entry".
pub type LogIndex = u64;

/// Session identifier: the log index at which the session was registered.
pub type SessionId = u64;

/// Discriminator for the payload carried by a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state machine command submitted by a client.
    Command,
    /// A query projected through the log for linearizable reads.
    Query,
    /// A configuration change (membership, session registration).
    Configuration,
    /// A blank entry appended by a newly elected leader to commit its term.
    Noop,
}

/// A log entry as created by the leader.
///
/// The timestamp is stamped once by the leader when the entry is built and
/// flows into the state machine as a read-only parameter; replicas never
/// consult their own clocks while applying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

impl Entry {
    pub fn new(kind: EntryKind, payload: Vec<u8>, timestamp: u64) -> Self {
        Self {
            kind,
            payload,
            timestamp,
        }
    }

    /// A blank term-opening entry.
    pub fn noop(timestamp: u64) -> Self {
        Self::new(EntryKind::Noop, Vec::new(), timestamp)
    }
}

/// The unit of log I/O: an entry bound to its index and term, together with
/// its serialized payload size in bytes.
///
/// Log Matching invariant: if two logs contain an entry with the same
/// `(index, term)`, the logs are identical at all prior indexes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub entry: Entry,
    pub size: u32,
}

impl IndexedEntry {
    pub fn new(index: LogIndex, term: Term, entry: Entry, size: u32) -> Self {
        Self {
            index,
            term,
            entry,
            size,
        }
    }
}

/// Canonical error type shared across the replication subsystems.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("log: {0}")]
    Log(String),
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("config: {0}")]
    Config(String),
    #[error("no leader known")]
    NoLeader,
    #[error("illegal member state: {0}")]
    IllegalMemberState(String),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("command failed: {0}")]
    CommandFailure(String),
    #[error("application: {0}")]
    Application(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `RaftError`.
pub type RaftResult<T> = Result<T, RaftError>;

/// A byte-count configuration value that accepts suffixed notation.
///
/// Deserializes from either a plain integer or a string such as `"16MB"` or
/// `"512KiB"`; serializes back as the raw byte count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u64>() {
            return Ok(ByteSize(n));
        }
        byte_unit::Byte::parse_str(s, true)
            .map(|b| ByteSize(b.as_u64()))
            .map_err(|e| RaftError::Config(format!("invalid size '{}': {}", s, e)))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ByteSize(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A cluster member as named in the bootstrap configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    pub address: String,
}

/// The cluster section of the bootstrap configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

/// A replication group: the system management group or a user partition group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(rename = "type")]
    pub group_type: String,
    pub partitions: u32,
    #[serde(default = "GroupConfig::default_segment_size")]
    pub segment_size: ByteSize,
}

impl GroupConfig {
    fn default_segment_size() -> ByteSize {
        ByteSize(32 * 1024 * 1024)
    }
}

/// Bootstrap configuration for a server process.
///
/// Produced by an external configuration loader; this crate only defines the
/// typed shape. The binary deserializes it from JSON.
///
/// # Example
/// ```
/// use common::{ServerConfig, ClusterSection};
///
/// let config = ServerConfig::builder()
///     .cluster(ClusterSection { name: "test".into(), members: vec![] })
///     .build();
/// assert_eq!(config.cluster.name, "test");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct ServerConfig {
    /// Cluster name and member roster.
    pub cluster: ClusterSection,
    /// The system management replication group.
    #[serde(default)]
    pub management_group: Option<GroupConfig>,
    /// User partition groups keyed by name.
    #[serde(default)]
    #[builder(default)]
    pub partition_groups: HashMap<String, GroupConfig>,
    /// Named profiles enabled for this server.
    #[serde(default)]
    #[builder(default)]
    pub profiles: Vec<String>,
    /// Directory where log segments, snapshots, and metadata live.
    #[serde(default = "ServerConfig::default_data_dir")]
    #[builder(default = PathBuf::from("./raft_data"))]
    pub data_dir: PathBuf,
}

impl ServerConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("./raft_data")
    }

    /// The segment size for the management group log, or the default when no
    /// management group is configured.
    pub fn segment_size(&self) -> u64 {
        self.management_group
            .as_ref()
            .map(|g| g.segment_size.as_u64())
            .unwrap_or_else(|| GroupConfig::default_segment_size().as_u64())
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        ByteSize, Entry, EntryKind, IndexedEntry, LogIndex, NodeId, RaftError, RaftResult,
        ServerConfig, SessionId, Term,
    };
}
