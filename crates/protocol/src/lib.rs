//! Wire protocol for replication traffic between servers and clients.
//!
//! Defines the logical request/response messages exchanged on the append,
//! install, vote, query, and command paths, the shared status and error
//! taxonomy, and a frame-based serialization helper for stream transports.
//! The HTTP adapter serializes these same types as JSON bodies.

use common::{Entry, IndexedEntry, LogIndex, NodeId, RaftError, SessionId, Term};
use serde::{Deserialize, Serialize};

/// Outcome discriminator carried by every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error,
}

/// Error kinds surfaced to callers.
///
/// Role handlers never propagate raw faults to the transport; every failure
/// is rendered as one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No leader is currently known to this server.
    NoLeader,
    /// The receiving server's role or term cannot satisfy the request.
    IllegalMemberState,
    /// The command was rejected before reaching the state machine.
    CommandFailure,
    /// The state machine raised an application-defined failure.
    ApplicationError,
    /// An unexpected server-side fault.
    InternalError,
    /// The request named a session this server has not registered.
    UnknownSession,
    /// The request violated the wire protocol (gap, bad offset).
    ProtocolError,
}

impl From<&RaftError> for ErrorKind {
    fn from(err: &RaftError) -> Self {
        match err {
            RaftError::NoLeader => ErrorKind::NoLeader,
            RaftError::IllegalMemberState(_) => ErrorKind::IllegalMemberState,
            RaftError::UnknownSession(_) => ErrorKind::UnknownSession,
            RaftError::CommandFailure(_) => ErrorKind::CommandFailure,
            RaftError::Application(_) => ErrorKind::ApplicationError,
            RaftError::Protocol(_) => ErrorKind::ProtocolError,
            _ => ErrorKind::InternalError,
        }
    }
}

/// Read consistency requested by a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Monotonic reads within a session; may be served by a caught-up replica.
    Sequential,
    /// Linearizable within a leader lease window; leader-only.
    BoundedLinearizable,
    /// Fully linearizable; committed through the log.
    Linearizable,
}

/// Log replication request from a leader.
///
/// `log_index`/`log_term` identify the entry immediately preceding
/// `entries`; 0 means the entries start at the head of the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: NodeId,
    pub log_index: LogIndex,
    pub log_term: Term,
    pub entries: Vec<IndexedEntry>,
    pub commit_index: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: Status,
    pub term: Term,
    pub succeeded: bool,
    /// On success: the index of the last entry covered by the request.
    /// On failure: the receiver's last log index, for leader backtracking.
    pub log_index: LogIndex,
}

impl AppendResponse {
    pub fn ok(term: Term, succeeded: bool, log_index: LogIndex) -> Self {
        Self {
            status: Status::Ok,
            term,
            succeeded,
            log_index,
        }
    }
}

/// One chunk of a streamed snapshot install.
///
/// `offset` counts chunks, not bytes; the first chunk of an install always
/// carries offset 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub term: Term,
    pub leader: NodeId,
    pub id: u64,
    pub index: LogIndex,
    pub offset: u32,
    pub data: Vec<u8>,
    pub complete: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallResponse {
    pub status: Status,
    pub error: Option<ErrorKind>,
}

impl InstallResponse {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
        }
    }
}

/// Leader election vote solicitation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub status: Status,
    pub term: Term,
    pub granted: bool,
}

impl VoteResponse {
    pub fn ok(term: Term, granted: bool) -> Self {
        Self {
            status: Status::Ok,
            term,
            granted,
        }
    }
}

/// A read query against the replicated state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: SessionId,
    pub sequence: u64,
    /// The highest index the client has observed; used for monotonic reads.
    pub index: LogIndex,
    pub consistency: Consistency,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: Status,
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub result: Option<Vec<u8>>,
    pub error: Option<ErrorKind>,
}

impl QueryResponse {
    pub fn ok(index: LogIndex, event_index: LogIndex, result: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            index,
            event_index,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: Status::Error,
            index: 0,
            event_index: 0,
            result: None,
            error: Some(kind),
        }
    }
}

/// A state machine command submitted by a client session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: SessionId,
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: Status,
    pub index: LogIndex,
    pub event_index: LogIndex,
    pub result: Option<Vec<u8>>,
    pub error: Option<ErrorKind>,
    /// Routing hint when this server cannot accept commands.
    pub leader: Option<NodeId>,
}

impl CommandResponse {
    pub fn ok(index: LogIndex, event_index: LogIndex, result: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            index,
            event_index,
            result: Some(result),
            error: None,
            leader: None,
        }
    }

    pub fn error(kind: ErrorKind, leader: Option<NodeId>) -> Self {
        Self {
            status: Status::Error,
            index: 0,
            event_index: 0,
            result: None,
            error: Some(kind),
            leader,
        }
    }
}

/// The envelope a command entry carries through the log so replicas can
/// enforce at-most-once execution per session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub session: SessionId,
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

impl CommandEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .expect("command envelope encoding cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(envelope, _)| envelope)
            .map_err(|e| RaftError::Protocol(format!("bad command envelope: {}", e)))
    }
}

/// Construct a command entry carrying the given envelope.
pub fn command_entry(envelope: &CommandEnvelope, timestamp: u64) -> Entry {
    Entry::new(common::EntryKind::Command, envelope.encode(), timestamp)
}

/// Frame format: [u32 length (little-endian)][bincode payload]
pub mod frame {
    use super::*;
    use bincode::config;
    use std::io::{self, Read, Write};

    const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

    /// Write a framed message.
    pub fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
    where
        W: Write,
        T: Serialize,
    {
        let encoded = bincode::serde::encode_to_vec(message, config::standard())
            .map_err(|e| io::Error::other(format!("bincode encoding failed: {}", e)))?;

        let len = encoded.len() as u32;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }

        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        Ok(())
    }

    /// Read a framed message.
    pub fn read_message<R, T>(reader: &mut R) -> io::Result<T>
    where
        R: Read,
        T: for<'de> Deserialize<'de>,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);

        if len > MAX_FRAME_SIZE {
            return Err(io::Error::other(format!(
                "message too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let (message, _) = bincode::serde::decode_from_slice(&payload, config::standard())
            .map_err(|e| io::Error::other(format!("bincode decoding failed: {}", e)))?;

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Entry, EntryKind, IndexedEntry};
    use std::io::Cursor;

    #[test]
    fn append_request_round_trip() {
        let req = AppendRequest {
            term: 3,
            leader: 1,
            log_index: 5,
            log_term: 2,
            entries: vec![IndexedEntry::new(
                6,
                3,
                Entry::new(EntryKind::Command, b"x".to_vec(), 0),
                1,
            )],
            commit_index: 5,
        };

        let mut buf = Vec::new();
        frame::write_message(&mut buf, &req).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: AppendRequest = frame::read_message(&mut cursor).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn error_response_carries_kind() {
        let resp = QueryResponse::error(ErrorKind::NoLeader);

        let mut buf = Vec::new();
        frame::write_message(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: QueryResponse = frame::read_message(&mut cursor).unwrap();
        assert_eq!(decoded.status, Status::Error);
        assert_eq!(decoded.error, Some(ErrorKind::NoLeader));
    }

    #[test]
    fn command_envelope_round_trip() {
        let envelope = CommandEnvelope {
            session: 4,
            sequence: 9,
            bytes: b"put k v".to_vec(),
        };
        let decoded = CommandEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn command_envelope_rejects_garbage() {
        let result = CommandEnvelope::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            result,
            Err(common::RaftError::Protocol(_))
        ));
    }

    #[test]
    fn error_kind_mapping() {
        use common::RaftError;
        assert_eq!(ErrorKind::from(&RaftError::NoLeader), ErrorKind::NoLeader);
        assert_eq!(
            ErrorKind::from(&RaftError::UnknownSession(3)),
            ErrorKind::UnknownSession
        );
        assert_eq!(
            ErrorKind::from(&RaftError::Log("disk full".into())),
            ErrorKind::InternalError
        );
    }
}
