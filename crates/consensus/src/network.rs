//! Peer-to-peer transport for replication traffic.
//!
//! The [`Transport`] trait abstracts how requests reach other servers so
//! the consensus loop can run against an in-memory transport in tests. The
//! production implementation is [`HttpTransport`], which posts JSON bodies
//! to the peer's HTTP endpoints.

use crate::NodeId;
use async_trait::async_trait;
use common::{RaftError, RaftResult};
use protocol::{
    AppendRequest, AppendResponse, InstallRequest, InstallResponse, QueryRequest, QueryResponse,
    VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sends requests to one named peer and awaits its reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn append(&self, target: NodeId, request: AppendRequest) -> RaftResult<AppendResponse>;

    async fn install(&self, target: NodeId, request: InstallRequest)
        -> RaftResult<InstallResponse>;

    async fn vote(&self, target: NodeId, request: VoteRequest) -> RaftResult<VoteResponse>;

    async fn query(&self, target: NodeId, request: QueryRequest) -> RaftResult<QueryResponse>;
}

/// Cluster roster mapping node ids to base addresses.
#[derive(Clone, Debug, Default)]
pub struct ClusterRoster {
    nodes: HashMap<NodeId, String>,
}

impl ClusterRoster {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Create from a list of (node_id, address) pairs.
    pub fn from_peers(peers: &[(NodeId, String)]) -> Self {
        let mut roster = Self::new();
        for (id, addr) in peers {
            roster.add_node(*id, addr.clone());
        }
        roster
    }

    pub fn add_node(&mut self, node_id: NodeId, addr: impl Into<String>) {
        self.nodes.insert(node_id, addr.into());
    }

    pub fn get_address(&self, node_id: NodeId) -> Option<&str> {
        self.nodes.get(&node_id).map(|s| s.as_str())
    }
}

/// HTTP transport posting JSON to each peer's replication endpoints.
#[derive(Clone)]
pub struct HttpTransport {
    roster: Arc<ClusterRoster>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(roster: ClusterRoster) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to build HTTP client");

        Self {
            roster: Arc::new(roster),
            client,
        }
    }

    async fn post<Req, Resp>(&self, target: NodeId, endpoint: &str, request: &Req) -> RaftResult<Resp>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let base = self.roster.get_address(target).ok_or_else(|| {
            RaftError::Internal(format!("no address for node {}", target))
        })?;
        let url = format!("http://{}{}", base.trim_start_matches("http://"), endpoint);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RaftError::Internal(format!("send to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RaftError::Internal(format!(
                "HTTP {} from {}: {}",
                status, url, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RaftError::Internal(format!("bad response from {}: {}", url, e)))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("roster", &self.roster)
            .finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn append(&self, target: NodeId, request: AppendRequest) -> RaftResult<AppendResponse> {
        self.post(target, "/raft/append", &request).await
    }

    async fn install(
        &self,
        target: NodeId,
        request: InstallRequest,
    ) -> RaftResult<InstallResponse> {
        self.post(target, "/raft/install", &request).await
    }

    async fn vote(&self, target: NodeId, request: VoteRequest) -> RaftResult<VoteResponse> {
        self.post(target, "/raft/vote", &request).await
    }

    async fn query(&self, target: NodeId, request: QueryRequest) -> RaftResult<QueryResponse> {
        self.post(target, "/raft/query", &request).await
    }
}
