//! The follower role: a voting member replicating from the leader.
//!
//! Followers run the full append consistency check, including the
//! previous-entry term match, and write entries ahead of the commit index
//! so the leader can commit them once a quorum holds them.

use crate::context::ServerContext;
use crate::role;
use common::RaftResult;
use protocol::{AppendRequest, AppendResponse, QueryRequest, VoteRequest, VoteResponse};

/// Handle replicated entries from the leader.
///
/// Returns the response together with whether the request was accepted
/// (an accepted request resets the election timer).
pub fn append(
    ctx: &mut ServerContext,
    request: &AppendRequest,
) -> RaftResult<(AppendResponse, bool)> {
    if request.term < ctx.current_term {
        return Ok((role::append_rejection(ctx), false));
    }
    role::observe_leader(ctx, request.term, request.leader)?;

    // Check the entry preceding the batch. Indexes at or below the
    // snapshot boundary are committed and consistent by Leader
    // Completeness, so only live entries are checked.
    if request.log_index != 0 && request.log_index >= ctx.log.first_index() {
        match ctx.log.term_of(request.log_index) {
            None => return Ok((role::append_rejection(ctx), true)),
            Some(term) if term != request.log_term => {
                // A conflicting previous entry is speculative tail from an
                // older leader; drop it and report our shortened log.
                ctx.log.writer().truncate(request.log_index - 1)?;
                return Ok((role::append_rejection(ctx), true));
            }
            Some(_) => {}
        }
    }

    {
        let mut writer = ctx.log.writer();
        for entry in &request.entries {
            writer.reconcile(entry)?;
        }
    }

    let last_entry_index = request
        .entries
        .last()
        .map(|e| e.index)
        .unwrap_or(request.log_index);
    let new_commit = ctx
        .commit_index()
        .max(request.commit_index.min(last_entry_index));
    ctx.set_commit_index(new_commit);
    ctx.executor.apply_all(&ctx.log, new_commit)?;
    ctx.assert_invariants();

    Ok((
        AppendResponse::ok(ctx.current_term, true, last_entry_index),
        true,
    ))
}

/// Grant a vote when the candidate's term is current, we have not voted
/// for anyone else, and the candidate's log is at least as up to date.
pub fn vote(ctx: &mut ServerContext, request: &VoteRequest) -> RaftResult<VoteResponse> {
    ctx.advance_term(request.term)?;

    if request.term < ctx.current_term {
        return Ok(VoteResponse::ok(ctx.current_term, false));
    }

    match ctx.voted_for {
        None => {}
        Some(candidate) if candidate == request.candidate => {}
        Some(_) => return Ok(VoteResponse::ok(ctx.current_term, false)),
    }

    let ours = (ctx.log.last_term(), ctx.log.last_index());
    if (request.last_log_term, request.last_log_index) < ours {
        return Ok(VoteResponse::ok(ctx.current_term, false));
    }

    ctx.record_vote(request.candidate)?;
    tracing::debug!(candidate = request.candidate, term = ctx.current_term, "granted vote");
    Ok(VoteResponse::ok(ctx.current_term, true))
}

/// Followers use the same query policy as passive members.
pub fn query(ctx: &ServerContext, request: &QueryRequest) -> role::QueryDisposition {
    role::serve_or_forward(ctx, request)
}
