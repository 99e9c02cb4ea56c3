//! # ScopeSync Core
//!
//! State tree model, authority scopes, and per-node replication state for ScopeSync.
//!
//! This crate provides:
//! - An arena-backed tree of leaves, branches, and vines with stable replicable identities
//! - Authority scopes deciding who owns, writes, and reads each subtree
//! - Owner-side middleware validating leaf mutations
//! - Per-node replicators tracking subscribers and queuing unsigned packets
//! - Lazy, non-blocking reads that subscribe on first use

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod error;
pub mod handle;
pub mod middleware;
pub mod node;
pub mod path;
pub mod pending;
pub mod replicator;
pub mod scope;
pub mod tree;

pub use actor::{Actor, ClientId, ReplicaContext, Role};
pub use error::TreeError;
pub use handle::LeafHandle;
pub use middleware::{CheckError, Middleware, MiddlewareKind};
pub use node::{
    Definition, Fingerprint, InstanceId, Node, NodeId, NodeKey, NodeKind, NodeStatus,
    SubscriptionId, VineEvent, VineInstance,
};
pub use path::{NodePath, PathSegment};
pub use pending::{GetError, GetTicket, PendingGet, TypedGet};
pub use replicator::{ReplicationMode, Replicator, UnsignedPacket, Wrapped};
pub use scope::ScopeIndex;
pub use tree::{SetOutcome, StateTree};
