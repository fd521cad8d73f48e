//! The single-task server loop.
//!
//! One tokio task owns the [`ServerContext`] and the current [`Role`];
//! every external entry point posts a [`Message`] through a [`RaftHandle`]
//! and awaits a oneshot reply. Ownership by a single task is the
//! serialization guarantee that lets role handlers mutate state without
//! locks beyond the log writer lock.
//!
//! Peer RPCs issued by this server (replication, votes, snapshot streams,
//! query forwarding) run on spawned tasks; their completions come back as
//! internal events so the loop never blocks on the network.

use crate::config::{MemberKind, NodeConfig};
use crate::context::ServerContext;
use crate::machine::StateMachine;
use crate::network::Transport;
use crate::role::{
    self, candidate, follower, leader, passive, reserve, CandidateState, PendingSnapshotTable,
    QueryDisposition, Role, RoleKind,
};
use common::{Entry, EntryKind, LogIndex, NodeId, RaftError, RaftResult, Term};
use protocol::{
    AppendRequest, AppendResponse, CommandEnvelope, CommandRequest, CommandResponse, Consistency,
    ErrorKind, InstallRequest, InstallResponse, QueryRequest, QueryResponse, Status, VoteRequest,
    VoteResponse,
};
use rand::Rng;
use selector::{NodeSelector, SelectionStrategy};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Snapshot chunk size for leader-driven installs.
const INSTALL_CHUNK_BYTES: usize = 64 * 1024;

/// A request posted to the server task.
pub enum Message {
    Append(AppendRequest, oneshot::Sender<AppendResponse>),
    Install(InstallRequest, oneshot::Sender<InstallResponse>),
    Vote(VoteRequest, oneshot::Sender<VoteResponse>),
    Query(QueryRequest, oneshot::Sender<QueryResponse>),
    Command(CommandRequest, oneshot::Sender<CommandResponse>),
    Status(oneshot::Sender<ServerStatus>),
}

/// Point-in-time view of the server, for health reporting and tests.
#[derive(Clone, Debug)]
pub struct ServerStatus {
    pub node_id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_index: LogIndex,
}

/// Completions of peer RPCs issued by this server.
enum Event {
    AppendReply(NodeId, AppendResponse),
    VoteReply(NodeId, VoteResponse),
    InstallFinished(NodeId, LogIndex, bool),
}

/// Cloneable entry point to a running server task.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl RaftHandle {
    async fn call<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Message) -> RaftResult<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| RaftError::Internal("server task stopped".into()))?;
        rx.await
            .map_err(|_| RaftError::Internal("server task dropped the request".into()))
    }

    pub async fn append(&self, request: AppendRequest) -> RaftResult<AppendResponse> {
        self.call(|tx| Message::Append(request, tx)).await
    }

    pub async fn install(&self, request: InstallRequest) -> RaftResult<InstallResponse> {
        self.call(|tx| Message::Install(request, tx)).await
    }

    pub async fn vote(&self, request: VoteRequest) -> RaftResult<VoteResponse> {
        self.call(|tx| Message::Vote(request, tx)).await
    }

    pub async fn query(&self, request: QueryRequest) -> RaftResult<QueryResponse> {
        self.call(|tx| Message::Query(request, tx)).await
    }

    pub async fn command(&self, request: CommandRequest) -> RaftResult<CommandResponse> {
        self.call(|tx| Message::Command(request, tx)).await
    }

    pub async fn status(&self) -> RaftResult<ServerStatus> {
        self.call(Message::Status).await
    }
}

/// Start the server task for this node.
///
/// Must be called from within a tokio runtime. The returned handle posts
/// requests to the task; the join handle resolves when every `RaftHandle`
/// clone is dropped.
pub fn start_node<T: Transport>(
    config: NodeConfig,
    machine: Box<dyn StateMachine>,
    transport: Arc<T>,
) -> RaftResult<(RaftHandle, JoinHandle<()>)> {
    let ctx = ServerContext::open(&config, machine)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let forward_selector = ctx.selectors.create_selector(SelectionStrategy::Leader);

    let mut server = RaftServer {
        ctx,
        role: Role::Reserve,
        config,
        transport,
        rx,
        events_tx,
        events_rx,
        election_deadline: Instant::now(),
        forward_selector,
    };
    server.open_initial_role()?;

    let join = tokio::spawn(async move { server.run().await });
    Ok((RaftHandle { tx }, join))
}

struct RaftServer<T: Transport> {
    ctx: ServerContext,
    role: Role,
    config: NodeConfig,
    transport: Arc<T>,
    rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    election_deadline: Instant,
    forward_selector: NodeSelector,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<T: Transport> RaftServer<T> {
    fn open_initial_role(&mut self) -> RaftResult<()> {
        self.role = match self.config.member_kind {
            MemberKind::Reserve => Role::Reserve,
            MemberKind::Passive => {
                passive::open(&mut self.ctx)?;
                Role::Passive(PendingSnapshotTable::new())
            }
            MemberKind::Voting => Role::Follower(PendingSnapshotTable::new()),
        };
        self.reset_election_timer();
        tracing::info!(
            node = self.ctx.node_id,
            role = %self.role.kind(),
            term = self.ctx.current_term,
            "server opened"
        );
        Ok(())
    }

    async fn run(&mut self) {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // A lone voting server elects itself without waiting for a timeout.
        if self.role.kind() == RoleKind::Follower && self.config.peers.is_empty() {
            self.start_election();
        }

        loop {
            let election = tokio::time::sleep_until(self.election_deadline);
            tokio::select! {
                _ = heartbeat.tick(), if self.role.kind() == RoleKind::Leader => {
                    self.replicate_all();
                }
                _ = election, if matches!(self.role.kind(), RoleKind::Follower | RoleKind::Candidate) => {
                    self.start_election();
                }
                maybe_message = self.rx.recv() => match maybe_message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Append(request, tx) => {
                let response = self.on_append(&request);
                let _ = tx.send(response);
            }
            Message::Install(request, tx) => {
                let response = self.on_install(&request);
                let _ = tx.send(response);
            }
            Message::Vote(request, tx) => {
                let response = self.on_vote(&request);
                let _ = tx.send(response);
            }
            Message::Query(request, tx) => self.on_query(request, tx),
            Message::Command(request, tx) => self.on_command(request, tx),
            Message::Status(tx) => {
                let _ = tx.send(self.status());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AppendReply(from, response) => self.on_append_reply(from, response),
            Event::VoteReply(from, response) => self.on_vote_reply(from, response),
            Event::InstallFinished(target, index, success) => {
                if let Role::Leader(state) = &mut self.role {
                    if success {
                        leader::finish_install(state, target, index);
                    } else {
                        leader::set_installing(state, target, false);
                    }
                }
            }
        }
    }

    /// A storage fault is fatal to the role: park the server in the
    /// quiescent reserve role and surface the error to the operator.
    fn fatal(&mut self, err: RaftError) {
        tracing::error!(error = %err, "fatal storage fault; entering reserve role");
        self.role.close();
        self.role = Role::Reserve;
        self.ctx
            .executor
            .fail_waiters(ErrorKind::InternalError, "server entered reserve role");
    }

    /// Central term rule: any message from a newer term advances ours, and
    /// voting roles step down to follower.
    fn observe_term(&mut self, term: Term) {
        if term <= self.ctx.current_term {
            return;
        }
        if let Err(e) = self.ctx.advance_term(term) {
            self.fatal(e);
            return;
        }
        if self.role.kind().is_voting() && self.role.kind() != RoleKind::Follower {
            self.become_follower();
        }
    }

    fn on_append(&mut self, request: &AppendRequest) -> AppendResponse {
        self.observe_term(request.term);
        // A candidate yields to any leader of its term.
        if self.role.kind() == RoleKind::Candidate && request.term >= self.ctx.current_term {
            self.become_follower();
        }

        match self.role.kind() {
            RoleKind::Reserve => reserve::append(&self.ctx, request),
            RoleKind::Passive => match passive::append(&mut self.ctx, request) {
                Ok(response) => response,
                Err(e) => {
                    self.fatal(e);
                    AppendResponse {
                        status: Status::Error,
                        term: self.ctx.current_term,
                        succeeded: false,
                        log_index: self.ctx.log.last_index(),
                    }
                }
            },
            RoleKind::Follower => match follower::append(&mut self.ctx, request) {
                Ok((response, accepted)) => {
                    if accepted {
                        self.reset_election_timer();
                    }
                    response
                }
                Err(e) => {
                    self.fatal(e);
                    AppendResponse {
                        status: Status::Error,
                        term: self.ctx.current_term,
                        succeeded: false,
                        log_index: self.ctx.log.last_index(),
                    }
                }
            },
            // A stale leader; it will learn our term from the rejection.
            RoleKind::Candidate | RoleKind::Leader => role::append_rejection(&self.ctx),
        }
    }

    fn on_install(&mut self, request: &InstallRequest) -> InstallResponse {
        self.observe_term(request.term);
        if self.role.kind() == RoleKind::Candidate && request.term >= self.ctx.current_term {
            self.become_follower();
        }

        let result = match &mut self.role {
            Role::Passive(table) | Role::Follower(table) => {
                role::install(&mut self.ctx, table, request)
            }
            _ => return reserve::install(&self.ctx, request),
        };
        match result {
            Ok(response) => {
                if self.role.kind() == RoleKind::Follower {
                    self.reset_election_timer();
                }
                response
            }
            Err(e) => {
                self.fatal(e);
                InstallResponse::error(ErrorKind::InternalError)
            }
        }
    }

    fn on_vote(&mut self, request: &VoteRequest) -> VoteResponse {
        self.observe_term(request.term);

        match self.role.kind() {
            RoleKind::Reserve => reserve::vote(&self.ctx, request),
            RoleKind::Passive => passive::vote(&self.ctx, request),
            RoleKind::Follower => match follower::vote(&mut self.ctx, request) {
                Ok(response) => {
                    if response.granted {
                        self.reset_election_timer();
                    }
                    response
                }
                Err(e) => {
                    self.fatal(e);
                    VoteResponse {
                        status: Status::Error,
                        term: self.ctx.current_term,
                        granted: false,
                    }
                }
            },
            // Candidates voted for themselves; leaders already won the term.
            RoleKind::Candidate | RoleKind::Leader => candidate::vote(&self.ctx, request),
        }
    }

    fn on_query(&mut self, request: QueryRequest, tx: oneshot::Sender<QueryResponse>) {
        match self.role.kind() {
            RoleKind::Reserve => {
                let _ = tx.send(reserve::query(&self.ctx, &request));
            }
            RoleKind::Passive | RoleKind::Follower => {
                let disposition = if self.role.kind() == RoleKind::Passive {
                    passive::query(&self.ctx, &request)
                } else {
                    follower::query(&self.ctx, &request)
                };
                match disposition {
                    QueryDisposition::Respond(response) => {
                        let _ = tx.send(response);
                    }
                    QueryDisposition::Forward => self.forward_query(request, tx),
                }
            }
            RoleKind::Candidate => {
                let _ = tx.send(QueryResponse::error(ErrorKind::NoLeader));
            }
            RoleKind::Leader => self.leader_query(request, tx),
        }
    }

    fn leader_query(&mut self, request: QueryRequest, tx: oneshot::Sender<QueryResponse>) {
        match request.consistency {
            // The leader's applied state satisfies these directly.
            Consistency::Sequential | Consistency::BoundedLinearizable => {
                let _ = tx.send(role::local_query(&self.ctx, &request));
            }
            // Linearizable reads are projected through the log and answered
            // once the query entry commits.
            Consistency::Linearizable => {
                let entry = Entry::new(EntryKind::Query, request.bytes.clone(), now_millis());
                let appended = self.ctx.log.writer().append(self.ctx.current_term, entry);
                match appended {
                    Ok(indexed) => {
                        let rx = self.ctx.executor.register_waiter(indexed.index);
                        tokio::spawn(async move {
                            let response = match rx.await {
                                Ok(result) => match result.outcome {
                                    Ok(bytes) => {
                                        QueryResponse::ok(result.index, result.event_index, bytes)
                                    }
                                    Err(err) => QueryResponse::error(err.kind),
                                },
                                Err(_) => QueryResponse::error(ErrorKind::InternalError),
                            };
                            let _ = tx.send(response);
                        });
                        self.after_local_append();
                    }
                    Err(e) => {
                        self.fatal(e);
                        let _ = tx.send(QueryResponse::error(ErrorKind::InternalError));
                    }
                }
            }
        }
    }

    fn on_command(&mut self, request: CommandRequest, tx: oneshot::Sender<CommandResponse>) {
        match self.role.kind() {
            RoleKind::Leader => {}
            RoleKind::Reserve => {
                let _ = tx.send(reserve::command(&self.ctx, &request));
                return;
            }
            RoleKind::Passive => {
                let _ = tx.send(passive::command(&self.ctx, &request));
                return;
            }
            _ => {
                let response = match self.ctx.leader {
                    Some(leader) => {
                        CommandResponse::error(ErrorKind::IllegalMemberState, Some(leader))
                    }
                    None => CommandResponse::error(ErrorKind::NoLeader, None),
                };
                let _ = tx.send(response);
                return;
            }
        }

        // Session 0 requests registration: the configuration entry's log
        // index becomes the session id.
        let entry = if request.session == 0 {
            Entry::new(EntryKind::Configuration, Vec::new(), now_millis())
        } else {
            let envelope = CommandEnvelope {
                session: request.session,
                sequence: request.sequence,
                bytes: request.bytes,
            };
            protocol::command_entry(&envelope, now_millis())
        };

        let appended = self.ctx.log.writer().append(self.ctx.current_term, entry);
        match appended {
            Ok(indexed) => {
                let rx = self.ctx.executor.register_waiter(indexed.index);
                tokio::spawn(async move {
                    let response = match rx.await {
                        Ok(result) => match result.outcome {
                            Ok(bytes) => {
                                CommandResponse::ok(result.index, result.event_index, bytes)
                            }
                            Err(err) => CommandResponse::error(err.kind, None),
                        },
                        Err(_) => CommandResponse::error(ErrorKind::InternalError, None),
                    };
                    let _ = tx.send(response);
                });
                self.after_local_append();
            }
            Err(e) => {
                self.fatal(e);
                let _ = tx.send(CommandResponse::error(ErrorKind::InternalError, None));
            }
        }
    }

    /// Relay a query to the leader and hand its response back verbatim.
    fn forward_query(&mut self, request: QueryRequest, tx: oneshot::Sender<QueryResponse>) {
        self.forward_selector.reset();
        let targets: Vec<NodeId> = std::iter::from_fn(|| self.forward_selector.next()).collect();
        if targets.is_empty() {
            let _ = tx.send(QueryResponse::error(ErrorKind::NoLeader));
            return;
        }

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            for target in targets {
                match transport.query(target, request.clone()).await {
                    Ok(response) => {
                        let _ = tx.send(response);
                        return;
                    }
                    Err(e) => {
                        tracing::trace!(target, error = %e, "query forward failed");
                    }
                }
            }
            let _ = tx.send(QueryResponse::error(ErrorKind::NoLeader));
        });
    }

    /// After appending locally as leader: advance the commit index (a lone
    /// server commits immediately) and ship the new tail.
    fn after_local_append(&mut self) {
        let result = if let Role::Leader(state) = &mut self.role {
            leader::advance_commit(&mut self.ctx, state)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            self.fatal(e);
            return;
        }
        self.replicate_all();
    }

    fn replicate_all(&mut self) {
        let plans = {
            let Role::Leader(state) = &mut self.role else {
                return;
            };
            let targets = leader::targets(state);
            let plans: Vec<(NodeId, leader::Dispatch)> = targets
                .into_iter()
                .map(|target| (target, leader::plan(&self.ctx, state, target)))
                .collect();
            for (target, plan) in &plans {
                if matches!(plan, leader::Dispatch::Snapshot) {
                    leader::set_installing(state, *target, true);
                }
            }
            plans
        };

        for (target, plan) in plans {
            match plan {
                leader::Dispatch::Skip => {}
                leader::Dispatch::Entries(request) => self.send_append(target, request),
                leader::Dispatch::Snapshot => self.send_snapshot(target),
            }
        }
    }

    fn replicate_one(&mut self, target: NodeId) {
        let plan = {
            let Role::Leader(state) = &mut self.role else {
                return;
            };
            let plan = leader::plan(&self.ctx, state, target);
            if matches!(plan, leader::Dispatch::Snapshot) {
                leader::set_installing(state, target, true);
            }
            plan
        };
        match plan {
            leader::Dispatch::Skip => {}
            leader::Dispatch::Entries(request) => self.send_append(target, request),
            leader::Dispatch::Snapshot => self.send_snapshot(target),
        }
    }

    fn send_append(&self, target: NodeId, request: AppendRequest) {
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match transport.append(target, request).await {
                Ok(response) => {
                    let _ = events.send(Event::AppendReply(target, response));
                }
                Err(e) => {
                    tracing::trace!(target, error = %e, "append send failed");
                }
            }
        });
    }

    /// Stream the current snapshot to a follower that is behind the log
    /// head, one chunk at a time.
    fn send_snapshot(&mut self, target: NodeId) {
        let snapshot = match self.ctx.snapshots.latest() {
            Some(snapshot) => snapshot,
            None => {
                tracing::warn!(target, "follower is behind the log head but no snapshot exists");
                if let Role::Leader(state) = &mut self.role {
                    leader::set_installing(state, target, false);
                }
                return;
            }
        };
        let data = match snapshot.data() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(target, error = %e, "failed to read snapshot for streaming");
                if let Role::Leader(state) = &mut self.role {
                    leader::set_installing(state, target, false);
                }
                return;
            }
        };

        let (id, index) = (snapshot.id(), snapshot.index());
        let term = self.ctx.current_term;
        let leader_id = self.ctx.node_id;
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let total = data.len().div_ceil(INSTALL_CHUNK_BYTES).max(1);
            for offset in 0..total {
                let start = offset * INSTALL_CHUNK_BYTES;
                let end = (start + INSTALL_CHUNK_BYTES).min(data.len());
                let request = InstallRequest {
                    term,
                    leader: leader_id,
                    id,
                    index,
                    offset: offset as u32,
                    data: data[start..end].to_vec(),
                    complete: offset + 1 == total,
                };
                match transport.install(target, request).await {
                    Ok(response) if response.status == Status::Ok => {}
                    _ => {
                        let _ = events.send(Event::InstallFinished(target, index, false));
                        return;
                    }
                }
            }
            let _ = events.send(Event::InstallFinished(target, index, true));
        });
    }

    fn on_append_reply(&mut self, from: NodeId, response: AppendResponse) {
        if response.term > self.ctx.current_term {
            self.observe_term(response.term);
            return;
        }
        let result = if let Role::Leader(state) = &mut self.role {
            leader::on_append_response(&mut self.ctx, state, from, &response)
        } else {
            return;
        };
        match result {
            Ok(retry) => {
                if retry {
                    self.replicate_one(from);
                }
            }
            Err(e) => self.fatal(e),
        }
    }

    fn on_vote_reply(&mut self, from: NodeId, response: VoteResponse) {
        if response.term > self.ctx.current_term {
            self.observe_term(response.term);
            return;
        }
        let cluster = self.config.peers.len() + 1;
        let won = if let Role::Candidate(state) = &mut self.role {
            response.granted
                && response.term == self.ctx.current_term
                && candidate::tally(state, cluster, from)
        } else {
            return;
        };
        if won {
            self.become_leader();
        }
    }

    fn start_election(&mut self) {
        if !self.role.kind().is_voting() {
            return;
        }
        self.ctx.set_leader(None);
        if let Err(e) = self.ctx.bump_term_voting_for_self() {
            self.fatal(e);
            return;
        }
        self.role.close();
        self.role = Role::Candidate(CandidateState::new(self.ctx.node_id));
        self.reset_election_timer();
        tracing::info!(term = self.ctx.current_term, "starting election");

        if self.config.peers.is_empty() {
            self.become_leader();
            return;
        }

        let request = candidate::solicitation(&self.ctx);
        for (target, _) in self.config.peers.clone() {
            let transport = Arc::clone(&self.transport);
            let events = self.events_tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                match transport.vote(target, request).await {
                    Ok(response) => {
                        let _ = events.send(Event::VoteReply(target, response));
                    }
                    Err(e) => {
                        tracing::trace!(target, error = %e, "vote send failed");
                    }
                }
            });
        }
    }

    fn become_follower(&mut self) {
        if self.role.kind() == RoleKind::Follower {
            return;
        }
        self.role.close();
        self.ctx
            .executor
            .fail_waiters(ErrorKind::IllegalMemberState, "leadership lost");
        self.role = Role::Follower(PendingSnapshotTable::new());
        self.reset_election_timer();
        tracing::info!(term = self.ctx.current_term, "stepped down to follower");
    }

    fn become_leader(&mut self) {
        self.role.close();
        let voting = self.config.voting_peer_ids();
        let observers = self.config.observer_ids();
        match leader::open(&mut self.ctx, &voting, &observers, now_millis()) {
            Ok(state) => {
                self.role = Role::Leader(state);
                self.after_local_append();
            }
            Err(e) => self.fatal(e),
        }
    }

    fn reset_election_timer(&mut self) {
        let timeout = rand::thread_rng().gen_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            node_id: self.ctx.node_id,
            role: self.role.kind(),
            term: self.ctx.current_term,
            leader: self.ctx.leader,
            commit_index: self.ctx.commit_index(),
            last_applied: self.ctx.executor.last_applied(),
            last_index: self.ctx.log.last_index(),
        }
    }
}
