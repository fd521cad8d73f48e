//! Replication core: the follower-side consensus state machine.
//!
//! This crate implements the per-server role state machine for a
//! Raft-replicated log: accepting append and snapshot-install traffic from
//! a leader, answering read queries at the requested consistency, and
//! applying the committed prefix to a deterministic user state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Server task                              │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────────┐  │
//! │  │ RaftHandle │──▶│  RaftServer  │──▶│ Role (reserve/passive/ │  │
//! │  │ (mpsc)     │   │ (one task)   │   │ follower/cand/leader)  │  │
//! │  └────────────┘   └──────────────┘   └────────────────────────┘  │
//! │        ▲                 │                      │                 │
//! │        │                 ▼                      ▼                 │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────────┐  │
//! │  │ HTTP server│   │ ServerContext│   │ SegmentedLog           │  │
//! │  │ (axum)     │   │ term/vote/   │   │ SnapshotStore          │  │
//! │  └────────────┘   │ leader/commit│   │ Executor (apply)       │  │
//! │                   └──────────────┘   └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The single-thread execution contract is realized by task ownership: one
//! tokio task owns the context and role, and all entry points post
//! messages to it. Long-running peer I/O (replication sends, snapshot
//! streams, query forwarding) runs on spawned tasks whose completions come
//! back as events.
//!
//! # Modules
//!
//! - [`config`]: per-node runtime configuration
//! - [`context`]: process-wide replicated state and durable metadata
//! - [`machine`]: the deterministic apply pipeline and session table
//! - [`role`]: role states and their request handlers
//! - [`server`]: the single-task server loop and its handle
//! - [`network`]: the peer transport trait and HTTP implementation
//! - [`http_server`]: axum endpoints for inbound replication traffic

pub mod config;
pub mod context;
pub mod http_server;
pub mod machine;
pub mod network;
pub mod role;
pub mod server;

pub use common::NodeId;
pub use config::{MemberKind, NodeConfig};
pub use context::{Metadata, MetaStore, ServerContext};
pub use http_server::{create_router, start_server, HttpHandle, HttpState};
pub use machine::{Executor, OperationError, OperationResult, StateMachine};
pub use network::{ClusterRoster, HttpTransport, Transport};
pub use role::{Role, RoleKind};
pub use server::{start_node, Message, RaftHandle, ServerStatus};
