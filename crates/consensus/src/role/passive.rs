//! The passive role: a non-voting member that materializes only committed
//! entries.
//!
//! Passive servers accept commit traffic and snapshot installs but never
//! vote, never lead, and never retain speculative tail entries. They serve
//! sequential reads locally once caught up and forward everything else to
//! the leader.

use crate::context::ServerContext;
use crate::role;
use common::RaftResult;
use protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ErrorKind, QueryRequest,
    Status, VoteRequest, VoteResponse,
};

/// On open, a passive server truncates any uncommitted entries: a server
/// that cannot vote must not hold a speculative tail that could later
/// conflict with the leader's canonical log.
pub fn open(ctx: &mut ServerContext) -> RaftResult<()> {
    let commit = ctx.commit_index();
    ctx.log.writer().truncate(commit)?;
    Ok(())
}

/// Handle replicated entries from the leader.
///
/// Unlike a follower, a passive server writes only entries that are known
/// committed by this request (`index <= newCommit`); anything past the new
/// commit point is left for a later request to deliver.
pub fn append(ctx: &mut ServerContext, request: &AppendRequest) -> RaftResult<AppendResponse> {
    if request.term < ctx.current_term {
        return Ok(role::append_rejection(ctx));
    }
    role::observe_leader(ctx, request.term, request.leader)?;

    let last = ctx.log.last_index();
    if request.log_index != 0 && request.log_index > last {
        // The leader is ahead of us; it will back up and retry.
        return Ok(role::append_rejection(ctx));
    }

    let last_entry_index = request
        .entries
        .last()
        .map(|e| e.index)
        .unwrap_or(request.log_index);
    let new_commit = ctx
        .commit_index()
        .max(request.commit_index.min(last_entry_index));

    {
        let mut writer = ctx.log.writer();
        for entry in &request.entries {
            if entry.index <= new_commit {
                writer.reconcile(entry)?;
            }
        }
    }

    ctx.set_commit_index(new_commit);
    ctx.executor.apply_all(&ctx.log, new_commit)?;
    ctx.assert_invariants();

    Ok(AppendResponse::ok(ctx.current_term, true, last_entry_index))
}

/// Passive servers cannot vote.
pub fn vote(ctx: &ServerContext, _request: &VoteRequest) -> VoteResponse {
    VoteResponse {
        status: Status::Error,
        term: ctx.current_term,
        granted: false,
    }
}

/// Queries follow the shared replica policy; see [`role::serve_or_forward`].
pub fn query(ctx: &ServerContext, request: &QueryRequest) -> role::QueryDisposition {
    role::serve_or_forward(ctx, request)
}

/// Passive servers do not accept commands; the client should retry at the
/// leader.
pub fn command(ctx: &ServerContext, _request: &CommandRequest) -> CommandResponse {
    CommandResponse::error(ErrorKind::IllegalMemberState, ctx.leader)
}
