//! Tree errors.

use crate::actor::Actor;
use crate::node::{InstanceId, NodeId};
use crate::scope::ScopeIndex;

/// Errors raised by tree construction and tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The key does not refer to a live node
    #[error("unknown node")]
    UnknownNode,

    /// No node carries this replicable identity
    #[error("unknown node id {0}")]
    UnknownNodeId(NodeId),

    /// No node lives at this path
    #[error("no node at path '{0}'")]
    PathNotFound(String),

    /// Two siblings share a key
    #[error("duplicate key '{key}' under '{parent}'")]
    DuplicateKey {
        /// Path of the parent
        parent: String,
        /// Offending key
        key: String,
    },

    /// The node has a different variant than the operation requires
    #[error("'{path}' is a {actual}, expected a {expected}")]
    WrongKind {
        /// Node path
        path: String,
        /// Required variant
        expected: &'static str,
        /// Actual variant
        actual: &'static str,
    },

    /// The actor may not write to this node
    #[error("{actor} may not write to '{path}' ({scope})")]
    Unauthorized {
        /// Writing actor
        actor: Actor,
        /// Node path
        path: String,
        /// Node scope
        scope: ScopeIndex,
    },

    /// The local role may not read this node
    #[error("'{path}' is not readable here ({scope})")]
    Unreadable {
        /// Node path
        path: String,
        /// Node scope
        scope: ScopeIndex,
    },

    /// The operation needs the local role to own the node
    #[error("'{path}' is not owned here ({scope})")]
    NotOwner {
        /// Node path
        path: String,
        /// Node scope
        scope: ScopeIndex,
    },

    /// A materialized vine instance claims an id already in use
    #[error("node id {0} is already registered")]
    NodeIdCollision(NodeId),

    /// The vine has no such instance
    #[error("unknown instance {instance} on '{path}'")]
    UnknownInstance {
        /// Vine path
        path: String,
        /// Missing instance
        instance: InstanceId,
    },

    /// A value could not be converted to or from JSON
    #[error("value conversion failed: {0}")]
    Value(String),
}
