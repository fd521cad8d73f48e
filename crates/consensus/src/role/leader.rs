//! The leader role: replicating its log to the cluster.
//!
//! On election the leader seeds per-follower progress, appends a blank
//! entry to commit its term, and thereafter ships entry batches on every
//! heartbeat. Commit advancement takes the quorum median over voting
//! members only; observers receive entries but never move the commit
//! index.

use crate::context::ServerContext;
use crate::role::{LeaderState, Replica};
use common::{Entry, LogIndex, NodeId, RaftResult};
use protocol::{AppendRequest, AppendResponse};

/// Cap on entries shipped in one append batch.
const MAX_BATCH_ENTRIES: u64 = 64;

/// What the replication loop should send to one follower.
pub enum Dispatch {
    /// Ship this batch.
    Entries(AppendRequest),
    /// The follower is behind the log head; stream the current snapshot.
    Snapshot,
    /// Nothing to do right now.
    Skip,
}

/// Open the leader role: seed replication state, claim leadership, and
/// append the term-opening blank entry.
pub fn open(
    ctx: &mut ServerContext,
    voting_peers: &[NodeId],
    observers: &[NodeId],
    timestamp: u64,
) -> RaftResult<LeaderState> {
    let state = LeaderState::new(voting_peers, observers, ctx.log.last_index());
    ctx.set_leader(Some(ctx.node_id));
    ctx.log
        .writer()
        .append(ctx.current_term, Entry::noop(timestamp))?;
    tracing::info!(term = ctx.current_term, "elected leader");
    Ok(state)
}

/// Plan the next send to `target`.
pub fn plan(ctx: &ServerContext, state: &LeaderState, target: NodeId) -> Dispatch {
    let Some(replica) = state.replicas.get(&target) else {
        return Dispatch::Skip;
    };
    if replica.installing {
        return Dispatch::Skip;
    }
    if replica.next_index < ctx.log.first_index() {
        return Dispatch::Snapshot;
    }

    let prev = replica.next_index - 1;
    let last = ctx.log.last_index();
    let to = last.min(replica.next_index + MAX_BATCH_ENTRIES - 1);
    let entries = if replica.next_index <= to {
        ctx.log.reader().range(replica.next_index, to)
    } else {
        Vec::new()
    };

    Dispatch::Entries(AppendRequest {
        term: ctx.current_term,
        leader: ctx.node_id,
        log_index: prev,
        log_term: ctx.log.term_of(prev).unwrap_or(0),
        entries,
        commit_index: ctx.commit_index(),
    })
}

/// Fold a follower's append response into the replication state.
///
/// Returns `true` when the follower rejected and should immediately be
/// retried with an earlier batch. Higher-term responses are handled by the
/// server loop before this is called.
pub fn on_append_response(
    ctx: &mut ServerContext,
    state: &mut LeaderState,
    from: NodeId,
    response: &AppendResponse,
) -> RaftResult<bool> {
    let last = ctx.log.last_index();
    let Some(replica) = state.replicas.get_mut(&from) else {
        return Ok(false);
    };

    if !response.succeeded {
        // The follower reported its last index; back up to just past it.
        replica.next_index = response
            .log_index
            .saturating_add(1)
            .min(last + 1)
            .max(1);
        return Ok(true);
    }

    replica.match_index = replica.match_index.max(response.log_index);
    replica.next_index = replica.match_index + 1;
    advance_commit(ctx, state)?;
    Ok(false)
}

/// Mark the start and end of a snapshot stream to `target`.
pub fn set_installing(state: &mut LeaderState, target: NodeId, installing: bool) {
    if let Some(replica) = state.replicas.get_mut(&target) {
        replica.installing = installing;
    }
}

/// A snapshot stream finished at `index`; resume entries just past it.
pub fn finish_install(state: &mut LeaderState, target: NodeId, index: LogIndex) {
    if let Some(replica) = state.replicas.get_mut(&target) {
        replica.installing = false;
        replica.match_index = replica.match_index.max(index);
        replica.next_index = index + 1;
    }
}

/// Advance the commit index to the quorum median of voting members, but
/// only through entries of the current term (the Leader Completeness
/// guard), then apply.
pub fn advance_commit(ctx: &mut ServerContext, state: &LeaderState) -> RaftResult<()> {
    let mut indexes: Vec<LogIndex> = state
        .replicas
        .iter()
        .filter(|(id, _)| state.voting.contains(*id))
        .map(|(_, replica)| replica.match_index)
        .collect();
    indexes.push(ctx.log.last_index());
    indexes.sort_unstable_by(|a, b| b.cmp(a));

    let cluster = state.voting.len() + 1;
    let quorum = cluster / 2 + 1;
    let candidate = indexes.get(quorum - 1).copied().unwrap_or(0);

    if candidate > ctx.commit_index() && ctx.log.term_of(candidate) == Some(ctx.current_term) {
        ctx.set_commit_index(candidate);
        ctx.executor.apply_all(&ctx.log, candidate)?;
        ctx.assert_invariants();
    }
    Ok(())
}

/// The replicas currently tracked, for the replication loop.
pub fn targets(state: &LeaderState) -> Vec<NodeId> {
    state.replicas.keys().copied().collect()
}

/// Snapshot of one replica's progress, for status reporting and tests.
pub fn progress(state: &LeaderState, target: NodeId) -> Option<Replica> {
    state.replicas.get(&target).copied()
}
