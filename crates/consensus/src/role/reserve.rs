//! The reserve role: a quiescent standby.
//!
//! Reserve servers hold no log and reject replication, election, and
//! client traffic outright. The server also falls back to this role when a
//! fatal storage fault makes continued participation unsafe.

use crate::context::ServerContext;
use protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ErrorKind, InstallRequest,
    InstallResponse, QueryRequest, QueryResponse, Status, VoteRequest, VoteResponse,
};

pub fn append(ctx: &ServerContext, _request: &AppendRequest) -> AppendResponse {
    AppendResponse {
        status: Status::Error,
        term: ctx.current_term,
        succeeded: false,
        log_index: ctx.log.last_index(),
    }
}

pub fn install(_ctx: &ServerContext, _request: &InstallRequest) -> InstallResponse {
    InstallResponse::error(ErrorKind::IllegalMemberState)
}

pub fn vote(ctx: &ServerContext, _request: &VoteRequest) -> VoteResponse {
    VoteResponse {
        status: Status::Error,
        term: ctx.current_term,
        granted: false,
    }
}

pub fn query(_ctx: &ServerContext, _request: &QueryRequest) -> QueryResponse {
    QueryResponse::error(ErrorKind::IllegalMemberState)
}

pub fn command(ctx: &ServerContext, _request: &CommandRequest) -> CommandResponse {
    CommandResponse::error(ErrorKind::IllegalMemberState, ctx.leader)
}
