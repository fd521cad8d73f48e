//! Deterministic apply pipeline over the committed log prefix.
//!
//! The [`Executor`] feeds committed entries to a user-supplied
//! [`StateMachine`] in strictly increasing index order, tracks
//! `last_applied`, enforces at-most-once command execution per session, and
//! resolves waiters parked on entry indexes.

use common::{EntryKind, IndexedEntry, LogIndex, RaftError, RaftResult, SessionId};
use protocol::{CommandEnvelope, ErrorKind};
use raftlog::SegmentedLog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// The replicated application state.
///
/// Implementations must be deterministic: the state after applying a
/// sequence of entries is a pure function of that sequence. The entry
/// timestamp is the only time input; implementations must not read clocks.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command and return its result bytes.
    fn apply(&mut self, index: LogIndex, timestamp: u64, command: &[u8]) -> RaftResult<Vec<u8>>;

    /// Execute a read-only query against the current state.
    fn query(&self, payload: &[u8]) -> RaftResult<Vec<u8>>;

    /// Serialize the full state for snapshotting.
    fn snapshot(&self) -> RaftResult<Vec<u8>>;

    /// Replace the state from snapshot bytes.
    fn restore(&mut self, data: &[u8]) -> RaftResult<()>;
}

/// A cloneable operation failure, preserving the originating error kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    fn from_raft(err: &RaftError) -> Self {
        Self {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

/// Result bytes or a preserved failure.
pub type OperationOutcome = Result<Vec<u8>, OperationError>;

/// The result of applying one entry, delivered to waiters by index.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationResult {
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub outcome: OperationOutcome,
}

/// Per-session bookkeeping for at-most-once execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Session {
    /// Highest command sequence applied for this session.
    last_sequence: u64,
    /// Cached outcome of the last applied command.
    last_outcome: Option<OperationOutcome>,
    /// The session's event cursor.
    event_index: LogIndex,
}

/// Snapshot payload: session table plus opaque machine state.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    sessions: HashMap<SessionId, Session>,
    machine: Vec<u8>,
}

/// Applies committed entries to the state machine, in order, exactly once.
pub struct Executor {
    machine: Box<dyn StateMachine>,
    last_applied: LogIndex,
    sessions: HashMap<SessionId, Session>,
    waiters: HashMap<LogIndex, oneshot::Sender<OperationResult>>,
}

impl Executor {
    pub fn new(machine: Box<dyn StateMachine>) -> Self {
        Self {
            machine,
            last_applied: 0,
            sessions: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// The highest index fed to the state machine.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Park a waiter on the entry at `index`; it resolves when that entry
    /// is applied.
    pub fn register_waiter(&mut self, index: LogIndex) -> oneshot::Receiver<OperationResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(index, tx);
        rx
    }

    /// Fail all parked waiters, e.g. when leadership is lost and the
    /// entries they wait on may be overwritten.
    pub fn fail_waiters(&mut self, kind: ErrorKind, message: &str) {
        for (index, tx) in self.waiters.drain() {
            let _ = tx.send(OperationResult {
                index,
                event_index: 0,
                outcome: Err(OperationError {
                    kind,
                    message: message.to_string(),
                }),
            });
        }
    }

    /// Execute a read-only query against the current machine state.
    pub fn query(&self, payload: &[u8]) -> OperationResult {
        let outcome = self
            .machine
            .query(payload)
            .map_err(|e| OperationError::from_raft(&e));
        OperationResult {
            index: self.last_applied,
            event_index: self.last_applied,
            outcome,
        }
    }

    /// Whether a session registered at `session` has been applied here.
    pub fn session_known(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Apply one committed entry. The entry must be the successor of
    /// `last_applied`.
    pub fn apply(&mut self, entry: &IndexedEntry) -> OperationResult {
        assert_eq!(
            entry.index,
            self.last_applied + 1,
            "entries must be applied in index order"
        );

        let result = match entry.entry.kind {
            EntryKind::Noop => OperationResult {
                index: entry.index,
                event_index: self.last_applied,
                outcome: Ok(Vec::new()),
            },
            EntryKind::Configuration => {
                // A configuration entry registers the session keyed by its
                // own log index.
                self.sessions.insert(
                    entry.index,
                    Session {
                        event_index: entry.index,
                        ..Session::default()
                    },
                );
                OperationResult {
                    index: entry.index,
                    event_index: entry.index,
                    outcome: Ok(Vec::new()),
                }
            }
            EntryKind::Query => {
                let outcome = self
                    .machine
                    .query(&entry.entry.payload)
                    .map_err(|e| OperationError::from_raft(&e));
                OperationResult {
                    index: entry.index,
                    event_index: self.last_applied,
                    outcome,
                }
            }
            EntryKind::Command => self.apply_command(entry),
        };

        self.last_applied = entry.index;
        if let Some(tx) = self.waiters.remove(&entry.index) {
            let _ = tx.send(result.clone());
        }
        result
    }

    fn apply_command(&mut self, entry: &IndexedEntry) -> OperationResult {
        let envelope = match CommandEnvelope::decode(&entry.entry.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                return OperationResult {
                    index: entry.index,
                    event_index: self.last_applied,
                    outcome: Err(OperationError::from_raft(&e)),
                }
            }
        };

        let Some(session) = self.sessions.get(&envelope.session) else {
            return OperationResult {
                index: entry.index,
                event_index: self.last_applied,
                outcome: Err(OperationError::from_raft(&RaftError::UnknownSession(
                    envelope.session,
                ))),
            };
        };

        // At-most-once: a sequence at or below the session's cursor replays
        // the cached outcome instead of re-executing.
        if envelope.sequence <= session.last_sequence {
            let outcome = session
                .last_outcome
                .clone()
                .unwrap_or_else(|| Ok(Vec::new()));
            return OperationResult {
                index: entry.index,
                event_index: session.event_index,
                outcome,
            };
        }

        let outcome = self
            .machine
            .apply(entry.index, entry.entry.timestamp, &envelope.bytes)
            .map_err(|e| OperationError::from_raft(&e));

        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session checked above");
        session.last_sequence = envelope.sequence;
        session.last_outcome = Some(outcome.clone());
        session.event_index = entry.index;

        OperationResult {
            index: entry.index,
            event_index: session.event_index,
            outcome,
        }
    }

    /// Apply every entry in `(last_applied, up_to]` in index order.
    ///
    /// A commit index pointing past the durable tail is an internal
    /// invariant violation and surfaces as an error.
    pub fn apply_all(&mut self, log: &SegmentedLog, up_to: LogIndex) -> RaftResult<()> {
        while self.last_applied < up_to {
            let next = self.last_applied + 1;
            let Some(entry) = log.get(next) else {
                return Err(RaftError::Internal(format!(
                    "commit index {} runs past the log at {}",
                    up_to, next
                )));
            };
            self.apply(&entry);
        }
        Ok(())
    }

    /// Serialize sessions plus machine state for a snapshot.
    pub fn snapshot(&self) -> RaftResult<Vec<u8>> {
        let payload = SnapshotPayload {
            sessions: self.sessions.clone(),
            machine: self.machine.snapshot()?,
        };
        bincode::serde::encode_to_vec(&payload, bincode::config::legacy())
            .map_err(|e| RaftError::Snapshot(format!("failed to serialize snapshot: {}", e)))
    }

    /// Replace all state from an installed snapshot taken at `index`.
    pub fn restore(&mut self, index: LogIndex, data: &[u8]) -> RaftResult<()> {
        let (payload, _): (SnapshotPayload, _) =
            bincode::serde::decode_from_slice(data, bincode::config::legacy())
                .map_err(|e| RaftError::Snapshot(format!("failed to decode snapshot: {}", e)))?;
        self.machine.restore(&payload.machine)?;
        self.sessions = payload.sessions;
        self.last_applied = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Entry;
    use protocol::CommandEnvelope;

    /// Appends every applied command byte-string to a journal.
    struct Journal {
        entries: Vec<Vec<u8>>,
    }

    impl Journal {
        fn new() -> Self {
            Self { entries: Vec::new() }
        }
    }

    impl StateMachine for Journal {
        fn apply(&mut self, _index: LogIndex, _timestamp: u64, command: &[u8]) -> RaftResult<Vec<u8>> {
            if command == b"poison" {
                return Err(RaftError::Application("poisoned command".into()));
            }
            self.entries.push(command.to_vec());
            Ok(vec![self.entries.len() as u8])
        }

        fn query(&self, _payload: &[u8]) -> RaftResult<Vec<u8>> {
            Ok(vec![self.entries.len() as u8])
        }

        fn snapshot(&self) -> RaftResult<Vec<u8>> {
            bincode::serde::encode_to_vec(&self.entries, bincode::config::legacy())
                .map_err(|e| RaftError::Snapshot(e.to_string()))
        }

        fn restore(&mut self, data: &[u8]) -> RaftResult<()> {
            let (entries, _) = bincode::serde::decode_from_slice(data, bincode::config::legacy())
                .map_err(|e| RaftError::Snapshot(e.to_string()))?;
            self.entries = entries;
            Ok(())
        }
    }

    fn executor() -> Executor {
        Executor::new(Box::new(Journal::new()))
    }

    fn configuration_entry(index: LogIndex) -> IndexedEntry {
        IndexedEntry::new(index, 1, Entry::new(EntryKind::Configuration, vec![], 0), 0)
    }

    fn command_entry(index: LogIndex, session: SessionId, sequence: u64, bytes: &[u8]) -> IndexedEntry {
        let envelope = CommandEnvelope {
            session,
            sequence,
            bytes: bytes.to_vec(),
        };
        IndexedEntry::new(
            index,
            1,
            protocol::command_entry(&envelope, 0),
            envelope.bytes.len() as u32,
        )
    }

    #[test]
    fn applies_in_order_and_tracks_last_applied() {
        let mut executor = executor();
        executor.apply(&configuration_entry(1));
        let result = executor.apply(&command_entry(2, 1, 1, b"a"));
        assert_eq!(executor.last_applied(), 2);
        assert_eq!(result.outcome, Ok(vec![1]));
        assert_eq!(result.event_index, 2);
    }

    #[test]
    #[should_panic(expected = "index order")]
    fn out_of_order_apply_panics() {
        let mut executor = executor();
        executor.apply(&configuration_entry(2));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let mut executor = executor();
        let result = executor.apply(&command_entry(1, 99, 1, b"a"));
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownSession);
    }

    #[test]
    fn duplicate_sequence_replays_cached_outcome() {
        let mut executor = executor();
        executor.apply(&configuration_entry(1));
        let first = executor.apply(&command_entry(2, 1, 1, b"a"));
        // The same (session, sequence) arriving again must not re-execute.
        let replay = executor.apply(&command_entry(3, 1, 1, b"a"));
        assert_eq!(replay.outcome, first.outcome);

        // A fresh sequence executes normally.
        let next = executor.apply(&command_entry(4, 1, 2, b"b"));
        assert_eq!(next.outcome, Ok(vec![2]));
    }

    #[test]
    fn application_error_preserves_kind() {
        let mut executor = executor();
        executor.apply(&configuration_entry(1));
        let result = executor.apply(&command_entry(2, 1, 1, b"poison"));
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ApplicationError);

        // The failure is cached for the sequence like any other outcome.
        let replay = executor.apply(&command_entry(3, 1, 1, b"poison"));
        assert_eq!(replay.outcome.unwrap_err().kind, ErrorKind::ApplicationError);
    }

    #[tokio::test]
    async fn waiter_resolves_on_apply() {
        let mut executor = executor();
        let rx = executor.register_waiter(1);
        executor.apply(&configuration_entry(1));
        let result = rx.await.unwrap();
        assert_eq!(result.index, 1);
        assert!(result.outcome.is_ok());
    }

    #[tokio::test]
    async fn failed_waiters_receive_error() {
        let mut executor = executor();
        let rx = executor.register_waiter(5);
        executor.fail_waiters(ErrorKind::IllegalMemberState, "stepped down");
        let result = rx.await.unwrap();
        assert_eq!(result.outcome.unwrap_err().kind, ErrorKind::IllegalMemberState);
    }

    #[test]
    fn snapshot_round_trips_sessions_and_machine() {
        let mut executor = executor();
        executor.apply(&configuration_entry(1));
        executor.apply(&command_entry(2, 1, 1, b"a"));
        let data = executor.snapshot().unwrap();

        let mut restored = Executor::new(Box::new(Journal::new()));
        restored.restore(2, &data).unwrap();
        assert_eq!(restored.last_applied(), 2);
        assert!(restored.session_known(1));

        // The restored session still deduplicates.
        let replay = restored.apply(&command_entry(3, 1, 1, b"a"));
        assert_eq!(replay.outcome, Ok(vec![1]));
    }

    #[test]
    fn query_reads_current_state() {
        let mut executor = executor();
        executor.apply(&configuration_entry(1));
        executor.apply(&command_entry(2, 1, 1, b"a"));
        let result = executor.query(b"len");
        assert_eq!(result.outcome, Ok(vec![1]));
        assert_eq!(result.index, 2);
    }
}
