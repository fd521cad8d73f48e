//! Role states and the request-handling logic shared between them.
//!
//! Roles are tagged variants over a common capability set
//! `{open, close, append, install, vote, query, command}`. Logic shared by
//! several roles (term observation, the chunked snapshot install protocol,
//! the query freshness guard) lives here as free functions taking
//! `&mut ServerContext`; each role module layers its own behavior on top.

use crate::context::ServerContext;
use common::{LogIndex, NodeId, RaftResult};
use protocol::{
    AppendResponse, Consistency, ErrorKind, InstallRequest, InstallResponse, QueryRequest,
    QueryResponse,
};
use snapshot::Snapshot;
use std::collections::{HashMap, HashSet};
use std::fmt;

pub mod candidate;
pub mod follower;
pub mod leader;
pub mod passive;
pub mod reserve;

/// Discriminates the role for status reporting and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Reserve,
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl RoleKind {
    /// Whether this role participates in elections.
    pub fn is_voting(self) -> bool {
        matches!(self, RoleKind::Follower | RoleKind::Candidate | RoleKind::Leader)
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Reserve => "reserve",
            RoleKind::Passive => "passive",
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// The current role together with its role-specific state.
pub enum Role {
    Reserve,
    Passive(PendingSnapshotTable),
    Follower(PendingSnapshotTable),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Reserve => RoleKind::Reserve,
            Role::Passive(_) => RoleKind::Passive,
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    /// Release role-held resources when leaving the role.
    pub fn close(&mut self) {
        match self {
            Role::Passive(pending) | Role::Follower(pending) => pending.close_all(),
            _ => {}
        }
    }
}

/// Election bookkeeping while soliciting votes.
pub struct CandidateState {
    /// Members that granted their vote this round, self included.
    pub votes: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new(self_id: NodeId) -> Self {
        let mut votes = HashSet::new();
        votes.insert(self_id);
        Self { votes }
    }
}

/// Per-follower replication progress tracked by the leader.
#[derive(Clone, Copy, Debug)]
pub struct Replica {
    /// Next entry index to send.
    pub next_index: LogIndex,
    /// Highest index known replicated on the follower.
    pub match_index: LogIndex,
    /// A snapshot stream to this follower is in flight.
    pub installing: bool,
}

/// Leader-side replication state.
///
/// Observers (passive members) are replicated to like any follower but do
/// not count toward the commit quorum.
pub struct LeaderState {
    pub replicas: HashMap<NodeId, Replica>,
    pub voting: HashSet<NodeId>,
}

impl LeaderState {
    pub fn new(voting_peers: &[NodeId], observers: &[NodeId], last_index: LogIndex) -> Self {
        let replicas = voting_peers
            .iter()
            .chain(observers.iter())
            .map(|&id| {
                (
                    id,
                    Replica {
                        next_index: last_index + 1,
                        match_index: 0,
                        installing: false,
                    },
                )
            })
            .collect();
        Self {
            replicas,
            voting: voting_peers.iter().copied().collect(),
        }
    }
}

/// In-flight snapshot installs, held by the Passive and Follower roles.
///
/// At most one install is active at a time across all ids; `next_offset`
/// is the chunk expected next for that install.
#[derive(Default)]
pub struct PendingSnapshotTable {
    pending: HashMap<u64, Snapshot>,
    pub next_offset: u32,
}

impl PendingSnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Snapshot> {
        self.pending.get(&id)
    }

    /// Close and delete every pending snapshot, e.g. on role close.
    pub fn close_all(&mut self) {
        for (_, snapshot) in self.pending.drain() {
            snapshot.close();
            let _ = snapshot.delete();
        }
        self.next_offset = 0;
    }
}

/// Step 1 of the append/install contract: adopt the sender's term and
/// leader when the message is not stale.
pub fn observe_leader(ctx: &mut ServerContext, term: u64, leader: NodeId) -> RaftResult<()> {
    ctx.advance_term(term)?;
    ctx.set_leader(Some(leader));
    Ok(())
}

/// An append rejection carrying the receiver's last index so the leader
/// can back up.
pub fn append_rejection(ctx: &ServerContext) -> AppendResponse {
    AppendResponse::ok(ctx.current_term, false, ctx.log.last_index())
}

/// How a query should be completed.
pub enum QueryDisposition {
    /// Answer the caller directly.
    Respond(QueryResponse),
    /// Relay to the current leader through the node selector.
    Forward,
}

/// Serve a query from the local machine.
pub fn local_query(ctx: &ServerContext, request: &QueryRequest) -> QueryResponse {
    let result = ctx.executor.query(&request.bytes);
    match result.outcome {
        Ok(bytes) => QueryResponse::ok(result.index, result.event_index, bytes),
        Err(err) => QueryResponse::error(err.kind),
    }
}

/// The replica-side query policy shared by Passive and Follower.
///
/// SEQUENTIAL queries are served locally only when this server has applied
/// the client's session registration (`last_applied >= session`) and its
/// log is not behind its own commit pointer. Everything else is forwarded
/// to the leader; with no leader known the caller gets `NO_LEADER`.
pub fn serve_or_forward(ctx: &ServerContext, request: &QueryRequest) -> QueryDisposition {
    match request.consistency {
        Consistency::Sequential => {
            let fresh = ctx.executor.last_applied() >= request.session
                && ctx.log.last_index() >= ctx.commit_index();
            if fresh {
                return QueryDisposition::Respond(local_query(ctx, request));
            }
        }
        Consistency::BoundedLinearizable | Consistency::Linearizable => {}
    }
    if ctx.leader.is_none() {
        return QueryDisposition::Respond(QueryResponse::error(ErrorKind::NoLeader));
    }
    QueryDisposition::Forward
}

/// The chunked snapshot install protocol, shared by Passive and Follower.
///
/// Offsets count chunks. Duplicate chunks (offset below the expected one)
/// are acknowledged idempotently without a second write; a gap (offset
/// above the expected one) is a protocol violation.
pub fn install(
    ctx: &mut ServerContext,
    table: &mut PendingSnapshotTable,
    request: &InstallRequest,
) -> RaftResult<InstallResponse> {
    if request.term < ctx.current_term {
        return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
    }
    observe_leader(ctx, request.term, request.leader)?;

    // A pending install at a different index is stale: discard it and
    // treat the table as empty for this id.
    if let Some(pending) = table.pending.get(&request.id) {
        if pending.index() != request.index {
            pending.close();
            pending.delete()?;
            table.pending.remove(&request.id);
            table.next_offset = 0;
        }
    }

    if !table.pending.contains_key(&request.id) {
        if request.offset > 0 {
            // A re-sent final chunk of an already published snapshot is
            // acknowledged idempotently.
            if request.complete {
                if let Some(done) = ctx.snapshots.get_snapshot(request.id) {
                    if done.index() == request.index {
                        return Ok(InstallResponse::ok());
                    }
                }
            }
            return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
        }
        let snapshot = ctx.snapshots.create_snapshot(request.id, request.index)?;
        table.pending.insert(request.id, snapshot);
        table.next_offset = 0;
    }

    if request.offset > table.next_offset {
        return Ok(InstallResponse::error(ErrorKind::IllegalMemberState));
    }
    if request.offset < table.next_offset {
        return Ok(InstallResponse::ok());
    }

    let snapshot = table
        .pending
        .get(&request.id)
        .expect("pending snapshot created above");
    {
        let mut writer = snapshot.writer()?;
        writer.write(&request.data)?;
    }

    if request.complete {
        snapshot.persist()?;
        snapshot.complete()?;

        // Swing the machine onto the snapshot and line the log up with it,
        // unless the applied state has already moved past the snapshot.
        if request.index > ctx.executor.last_applied() {
            let data = snapshot.data()?;
            ctx.executor.restore(request.index, &data)?;
            if ctx.log.last_index() < request.index {
                ctx.log.writer().reset(request.index, request.term)?;
            }
            ctx.set_commit_index(request.index);
        }

        table.pending.remove(&request.id);
        table.next_offset = 0;
        tracing::info!(
            id = request.id,
            index = request.index,
            "installed snapshot"
        );
    } else {
        table.next_offset += 1;
    }

    Ok(InstallResponse::ok())
}
