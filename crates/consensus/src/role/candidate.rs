//! The candidate role: soliciting votes after an election timeout.
//!
//! Candidates reject votes for others in their term (they voted for
//! themselves) and convert to follower the moment a leader for the current
//! term appears. Vote counting and the promotion to leader happen in the
//! server loop, which owns the transport.

use crate::context::ServerContext;
use crate::role::CandidateState;
use common::NodeId;
use protocol::{VoteRequest, VoteResponse};

/// Record a granted vote. Returns `true` once a quorum of the cluster has
/// voted for this server.
pub fn tally(state: &mut CandidateState, members: usize, from: NodeId) -> bool {
    state.votes.insert(from);
    state.votes.len() > members / 2
}

/// A candidate has already voted for itself, so competing requests in the
/// same term are refused.
pub fn vote(ctx: &ServerContext, _request: &VoteRequest) -> VoteResponse {
    VoteResponse::ok(ctx.current_term, false)
}

/// The vote solicitation sent to every peer.
pub fn solicitation(ctx: &ServerContext) -> VoteRequest {
    VoteRequest {
        term: ctx.current_term,
        candidate: ctx.node_id,
        last_log_index: ctx.log.last_index(),
        last_log_term: ctx.log.last_term(),
    }
}
