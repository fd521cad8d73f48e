//! HTTP endpoints for replication traffic.
//!
//! Each node runs an axum server translating JSON-bodied POSTs into
//! messages for the server task: append, install, vote, query, and command
//! traffic, plus a health endpoint for operators.

use crate::server::RaftHandle;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use protocol::{AppendRequest, CommandRequest, InstallRequest, QueryRequest, VoteRequest};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub handle: RaftHandle,
}

impl HttpState {
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle }
    }
}

/// Create the router with all replication endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/raft/append", post(handle_append))
        .route("/raft/install", post(handle_install))
        .route("/raft/vote", post(handle_vote))
        .route("/raft/query", post(handle_query))
        .route("/raft/command", post(handle_command))
        .route("/health", post(handle_health).get(handle_health))
        .with_state(state)
}

/// Start the HTTP server on the given address.
///
/// Returns a handle that can be used to gracefully shut the server down.
pub async fn start_server(addr: SocketAddr, state: HttpState) -> Result<HttpHandle, std::io::Error> {
    let router = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(HttpHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        server_handle,
    })
}

/// Handle for managing a running HTTP server.
pub struct HttpHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl HttpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server to complete.
    pub async fn wait(self) -> Result<(), std::io::Error> {
        match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(format!("server task panicked: {}", e))),
        }
    }
}

async fn handle_append(
    State(state): State<HttpState>,
    Json(request): Json<AppendRequest>,
) -> impl IntoResponse {
    match state.handle.append(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_install(
    State(state): State<HttpState>,
    Json(request): Json<InstallRequest>,
) -> impl IntoResponse {
    match state.handle.install(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_vote(
    State(state): State<HttpState>,
    Json(request): Json<VoteRequest>,
) -> impl IntoResponse {
    match state.handle.vote(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_query(
    State(state): State<HttpState>,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    match state.handle.query(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_command(
    State(state): State<HttpState>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    match state.handle.command(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Health check endpoint reporting the server's replication status.
async fn handle_health(State(state): State<HttpState>) -> impl IntoResponse {
    match state.handle.status().await {
        Ok(status) => {
            let health = serde_json::json!({
                "status": "healthy",
                "node_id": status.node_id,
                "role": status.role.to_string(),
                "term": status.term,
                "leader": status.leader,
                "commit_index": status.commit_index,
                "last_applied": status.last_applied,
                "last_index": status.last_index,
            });
            (StatusCode::OK, Json(health)).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
