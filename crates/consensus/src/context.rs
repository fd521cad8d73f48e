//! Process-wide replicated state and its durable metadata.

use crate::config::NodeConfig;
use crate::machine::{Executor, StateMachine};
use common::{NodeId, RaftError, RaftResult, Term};
use raftlog::{LogConfig, SegmentedLog};
use selector::NodeSelectorManager;
use serde::{Deserialize, Serialize};
use snapshot::SnapshotStore;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Durable term and vote, persisted before either is acted upon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Atomic storage for [`Metadata`]: write-to-temp, fsync, rename, fsync dir.
pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn open(path: impl AsRef<Path>) -> RaftResult<(Self, Metadata)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let metadata = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| RaftError::Internal(format!("corrupt metadata file: {}", e)))?
        } else {
            Metadata::default()
        };
        Ok((Self { path }, metadata))
    }

    pub fn save(&self, metadata: &Metadata) -> RaftResult<()> {
        let temp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(metadata)
            .map_err(|e| RaftError::Internal(format!("failed to encode metadata: {}", e)))?;
        fs::write(&temp, &contents)?;

        let file = File::open(&temp)?;
        file.sync_all()?;

        fs::rename(&temp, &self.path)?;

        if let Some(parent) = self.path.parent() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

/// Per-server replicated state, owned by the single server task.
///
/// The single-thread execution contract is realized by ownership: exactly
/// one task holds the context, and every role handler borrows it mutably.
/// No locking beyond the log writer lock is needed.
pub struct ServerContext {
    pub node_id: NodeId,
    /// All cluster members, this node included.
    pub members: Vec<NodeId>,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// The leader observed this term, if any.
    pub leader: Option<NodeId>,
    pub log: SegmentedLog,
    pub snapshots: SnapshotStore,
    pub executor: Executor,
    pub selectors: NodeSelectorManager,
    meta: MetaStore,
}

impl ServerContext {
    /// Open all durable state for this node and wire up the executor.
    pub fn open(config: &NodeConfig, machine: Box<dyn StateMachine>) -> RaftResult<Self> {
        let (meta, metadata) = MetaStore::open(config.meta_path())?;
        let log = SegmentedLog::open(
            config.log_dir(),
            LogConfig::default().with_segment_bytes(config.segment_size),
        )?;
        let snapshots = SnapshotStore::open(config.snapshot_dir())?;
        let mut executor = Executor::new(machine);

        // Recover the machine from the newest complete snapshot, then let
        // the log replay the committed suffix on top of it.
        if let Some(snapshot) = snapshots.latest() {
            let index = snapshot.index();
            executor.restore(index, &snapshot.data()?)?;
            log.set_commit_index(index);
            if log.last_index() < index {
                log.writer().reset(index, log.last_term())?;
            }
        }

        let members = config.members();
        let selectors = NodeSelectorManager::new(None, members.clone());

        Ok(Self {
            node_id: config.node_id,
            members,
            current_term: metadata.current_term,
            voted_for: metadata.voted_for,
            leader: None,
            log,
            snapshots,
            executor,
            selectors,
            meta,
        })
    }

    /// The highest index known committed.
    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    /// Advance the commit index. Monotonic; never moves backwards.
    pub fn set_commit_index(&self, index: u64) {
        self.log.set_commit_index(index);
    }

    /// Advance to `term` if it is newer, clearing the vote and persisting.
    /// Returns whether the term moved.
    pub fn advance_term(&mut self, term: Term) -> RaftResult<bool> {
        if term <= self.current_term {
            return Ok(false);
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader = None;
        self.persist_meta()?;
        tracing::info!(term, "advanced to new term");
        Ok(true)
    }

    /// Start an election round: increment the term and vote for self.
    pub fn bump_term_voting_for_self(&mut self) -> RaftResult<()> {
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.leader = None;
        self.persist_meta()
    }

    /// Record a vote in the current term. Durable before the reply is sent.
    pub fn record_vote(&mut self, candidate: NodeId) -> RaftResult<()> {
        self.voted_for = Some(candidate);
        self.persist_meta()
    }

    /// Track the leader observed this term and refresh query routing.
    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader == leader {
            return;
        }
        self.leader = leader;
        self.selectors.reset_all(leader, self.members.clone());
        if let Some(leader) = leader {
            tracing::info!(leader, term = self.current_term, "observed leader");
        }
    }

    fn persist_meta(&self) -> RaftResult<()> {
        self.meta.save(&Metadata {
            current_term: self.current_term,
            voted_for: self.voted_for,
        })
    }

    /// Debug-time check of the core ordering invariant.
    pub fn assert_invariants(&self) {
        debug_assert!(
            self.executor.last_applied() <= self.commit_index(),
            "last_applied {} must not pass commit_index {}",
            self.executor.last_applied(),
            self.commit_index()
        );
    }
}
