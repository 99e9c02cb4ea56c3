//! Network errors.

use scopesync_core::{Actor, Fingerprint, NodeId, TreeError};
use scopesync_proto::MessageError;

/// Peer behaviour that ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// The request did not decode
    #[error("malformed request: {0}")]
    Malformed(MessageError),

    /// No node carries the id
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),

    /// An update addressed something other than a leaf
    #[error("update addressed {node}, which is a {kind}")]
    NotALeaf {
        /// Addressed node
        node: NodeId,
        /// Its variant
        kind: &'static str,
    },

    /// The peer wrote a node it may not write
    #[error("unauthorized write to {node}: {reason}")]
    Unauthorized {
        /// Addressed node
        node: NodeId,
        /// Authority failure
        reason: String,
    },

    /// A subscribe reached a role that does not own the node
    #[error("subscribe to {0}, which is not owned here")]
    NotOwner(NodeId),

    /// The peer built a different tree
    #[error("handshake mismatch: local {local}, remote {remote}")]
    HandshakeMismatch {
        /// Local fingerprint
        local: Fingerprint,
        /// Fingerprint sent by the peer
        remote: Fingerprint,
    },

    /// A client received a handshake
    #[error("handshake received by a client")]
    UnexpectedHandshake,

    /// Traffic arrived before a matching handshake
    #[error("{kind} before handshake")]
    NotHandshaken {
        /// Offending packet kind
        kind: &'static str,
    },

    /// A packet kind the local role never accepts
    #[error("{kind} is not accepted by the {role}")]
    UnexpectedPacket {
        /// Offending packet kind
        kind: &'static str,
        /// Local role
        role: &'static str,
    },

    /// A client received traffic from someone other than the server
    #[error("traffic from {0}, clients only accept the server")]
    UntrustedSource(Actor),

    /// An instance announcement could not be mirrored
    #[error("invalid instance packet for {node}: {reason}")]
    InvalidInstance {
        /// Vine node
        node: NodeId,
        /// Failure
        reason: String,
    },
}

impl ProtocolViolation {
    /// Classify a tree error raised while handling a packet for `node`.
    #[must_use]
    pub fn from_tree(node: NodeId, err: TreeError) -> Self {
        match err {
            TreeError::UnknownNodeId(id) => ProtocolViolation::UnknownNode(id),
            TreeError::WrongKind { actual, .. } => {
                ProtocolViolation::NotALeaf { node, kind: actual }
            }
            TreeError::Unauthorized { .. } => ProtocolViolation::Unauthorized {
                node,
                reason: err.to_string(),
            },
            TreeError::NotOwner { .. } => ProtocolViolation::NotOwner(node),
            other => ProtocolViolation::InvalidInstance {
                node,
                reason: other.to_string(),
            },
        }
    }
}

/// Delivery failures reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No route to the destination
    #[error("unknown destination {0}")]
    UnknownDestination(Actor),

    /// The connection to the destination is closed
    #[error("connection to {0} is closed")]
    Closed(Actor),
}

/// Errors surfaced by the coordinator and runtime.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A peer violated the protocol and was disconnected
    #[error("protocol violation by {actor}: {violation}")]
    Protocol {
        /// Offending actor
        actor: Actor,
        /// What it did
        violation: ProtocolViolation,
    },

    /// A local tree operation failed
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Encoding failed
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The runtime is no longer accepting events
    #[error("runtime stopped")]
    RuntimeStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_core::ScopeIndex;

    #[test]
    fn tree_errors_map_to_violations() {
        let node = NodeId(3);
        assert_eq!(
            ProtocolViolation::from_tree(node, TreeError::UnknownNodeId(node)),
            ProtocolViolation::UnknownNode(node)
        );
        assert_eq!(
            ProtocolViolation::from_tree(
                node,
                TreeError::WrongKind {
                    path: "Public".to_string(),
                    expected: "leaf",
                    actual: "branch"
                }
            ),
            ProtocolViolation::NotALeaf {
                node,
                kind: "branch"
            }
        );
        assert_eq!(
            ProtocolViolation::from_tree(
                node,
                TreeError::NotOwner {
                    path: "Public".to_string(),
                    scope: ScopeIndex::PublicServer
                }
            ),
            ProtocolViolation::NotOwner(node)
        );
        assert!(matches!(
            ProtocolViolation::from_tree(node, TreeError::NodeIdCollision(node)),
            ProtocolViolation::InvalidInstance { .. }
        ));
    }
}
