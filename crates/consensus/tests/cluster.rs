//! End-to-end cluster behavior over an in-memory transport.

mod support;

use async_trait::async_trait;
use common::{NodeId, RaftError, RaftResult};
use consensus::{start_node, MemberKind, NodeConfig, RaftHandle, RoleKind, Transport};
use protocol::{
    AppendRequest, AppendResponse, CommandRequest, Consistency, InstallRequest, InstallResponse,
    QueryRequest, QueryResponse, Status, VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::Journal;
use tempfile::TempDir;

/// Routes RPCs directly to the target node's handle.
#[derive(Default)]
struct MeshTransport {
    nodes: Mutex<HashMap<NodeId, RaftHandle>>,
}

impl MeshTransport {
    fn register(&self, id: NodeId, handle: RaftHandle) {
        self.nodes.lock().unwrap().insert(id, handle);
    }

    fn disconnect(&self, id: NodeId) {
        self.nodes.lock().unwrap().remove(&id);
    }

    fn target(&self, id: NodeId) -> RaftResult<RaftHandle> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| RaftError::Internal(format!("node {} unreachable", id)))
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn append(&self, target: NodeId, request: AppendRequest) -> RaftResult<AppendResponse> {
        self.target(target)?.append(request).await
    }

    async fn install(
        &self,
        target: NodeId,
        request: InstallRequest,
    ) -> RaftResult<InstallResponse> {
        self.target(target)?.install(request).await
    }

    async fn vote(&self, target: NodeId, request: VoteRequest) -> RaftResult<VoteResponse> {
        self.target(target)?.vote(request).await
    }

    async fn query(&self, target: NodeId, request: QueryRequest) -> RaftResult<QueryResponse> {
        self.target(target)?.query(request).await
    }
}

struct Cluster {
    handles: HashMap<NodeId, RaftHandle>,
    mesh: Arc<MeshTransport>,
    _dirs: Vec<TempDir>,
}

/// Boot `voting` voting nodes (ids 1..=voting) plus optional passive
/// observers with the next ids.
fn boot(voting: u64, passives: u64) -> Cluster {
    let mesh = Arc::new(MeshTransport::default());
    let mut handles = HashMap::new();
    let mut dirs = Vec::new();
    let all: Vec<NodeId> = (1..=voting + passives).collect();

    for &id in &all {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig::new(id, dir.path().to_path_buf())
            .with_election_timeout(100, 300)
            .with_heartbeat_interval(25);
        for &peer in &all {
            if peer == id {
                continue;
            }
            if peer <= voting {
                config = config.with_peer(peer, format!("mem://{}", peer));
            } else {
                config = config.with_observer(peer, format!("mem://{}", peer));
            }
        }
        if id > voting {
            config = config.with_member_kind(MemberKind::Passive);
        }

        let (handle, _task) =
            start_node(config, Box::new(Journal::new()), Arc::clone(&mesh)).unwrap();
        mesh.register(id, handle.clone());
        handles.insert(id, handle);
        dirs.push(dir);
    }

    Cluster {
        handles,
        mesh,
        _dirs: dirs,
    }
}

/// Poll until one of `handles` reports itself leader, skipping `except`.
async fn wait_for_leader(
    handles: &HashMap<NodeId, RaftHandle>,
    except: Option<NodeId>,
) -> NodeId {
    for _ in 0..200 {
        for (&id, handle) in handles {
            if Some(id) == except {
                continue;
            }
            if let Ok(status) = handle.status().await {
                if status.role == RoleKind::Leader {
                    return id;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for a leader");
}

/// Poll until every handle has applied at least `index`.
async fn wait_until_applied(handles: &HashMap<NodeId, RaftHandle>, index: u64) {
    for _ in 0..200 {
        let mut done = true;
        for handle in handles.values() {
            match handle.status().await {
                Ok(status) if status.last_applied >= index => {}
                _ => {
                    done = false;
                    break;
                }
            }
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for index {} to apply everywhere", index);
}

fn command(session: u64, sequence: u64, bytes: &[u8]) -> CommandRequest {
    CommandRequest {
        session,
        sequence,
        bytes: bytes.to_vec(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_elect_a_leader_and_replicate() {
    let cluster = boot(3, 0);
    let leader_id = wait_for_leader(&cluster.handles, None).await;
    let leader = cluster.handles[&leader_id].clone();

    // Register a session, then run a command through it.
    let register = leader.command(command(0, 0, &[])).await.unwrap();
    assert_eq!(register.status, Status::Ok);
    let session = register.index;

    let put = leader.command(command(session, 1, b"first")).await.unwrap();
    assert_eq!(put.status, Status::Ok);

    // Every node converges on the applied prefix.
    wait_until_applied(&cluster.handles, put.index).await;

    // A linearizable read projected through the log sees the write.
    let read = leader
        .query(QueryRequest {
            session,
            sequence: 2,
            index: 0,
            consistency: Consistency::Linearizable,
            bytes: vec![],
        })
        .await
        .unwrap();
    assert_eq!(read.status, Status::Ok);
    assert_eq!(read.result, Some(vec![1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_command_sequence_executes_once() {
    let cluster = boot(3, 0);
    let leader_id = wait_for_leader(&cluster.handles, None).await;
    let leader = cluster.handles[&leader_id].clone();

    let session = leader.command(command(0, 0, &[])).await.unwrap().index;

    let first = leader
        .command(command(session, 1, b"only-once"))
        .await
        .unwrap();
    // The client never saw the ack and retries the same sequence.
    let retry = leader
        .command(command(session, 1, b"only-once"))
        .await
        .unwrap();
    assert_eq!(first.result, retry.result);

    // The journal grew by exactly one command: a fresh sequence reports
    // journal length 2, not 3.
    let second = leader
        .command(command(session, 2, b"second"))
        .await
        .unwrap();
    assert_eq!(second.result, Some(vec![2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn passive_member_catches_up_and_serves_sequential_reads() {
    let cluster = boot(3, 1);
    let leader_id = wait_for_leader(&cluster.handles, None).await;
    let leader = cluster.handles[&leader_id].clone();
    let passive = cluster.handles[&4].clone();

    let session = leader.command(command(0, 0, &[])).await.unwrap().index;
    let put = leader
        .command(command(session, 1, b"observed"))
        .await
        .unwrap();

    // The passive member materializes the committed prefix.
    wait_until_applied(&cluster.handles, put.index).await;

    let status = passive.status().await.unwrap();
    assert_eq!(status.role, RoleKind::Passive);

    // Now fresh for this session, the passive serves the read itself.
    let read = passive
        .query(QueryRequest {
            session,
            sequence: 2,
            index: 0,
            consistency: Consistency::Sequential,
            bytes: vec![],
        })
        .await
        .unwrap();
    assert_eq!(read.status, Status::Ok);
    assert_eq!(read.result, Some(vec![1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_elects_a_new_leader_after_the_old_one_vanishes() {
    let cluster = boot(3, 0);
    let old_leader = wait_for_leader(&cluster.handles, None).await;

    // Partition the leader away.
    cluster.mesh.disconnect(old_leader);

    let new_leader = wait_for_leader(&cluster.handles, Some(old_leader)).await;
    assert_ne!(new_leader, old_leader);

    // The replacement accepts traffic.
    let response = cluster.handles[&new_leader]
        .command(command(0, 0, &[]))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Ok);
}
