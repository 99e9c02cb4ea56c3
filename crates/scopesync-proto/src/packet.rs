//! Signed packets.

use scopesync_core::{Actor, Fingerprint, InstanceId, NodeId, UnsignedPacket, Wrapped};
use serde_json::Value;

/// A packet bound to a node identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Structural parity check, sent by clients before anything else
    Handshake(Fingerprint),
    /// New value for a leaf
    Update {
        /// Target leaf
        node: NodeId,
        /// The value
        value: Value,
    },
    /// Request to be subscribed to a node
    Subscribe {
        /// Target node
        node: NodeId,
    },
    /// The sender no longer observes a node
    Unsubscribe {
        /// Target node
        node: NodeId,
    },
    /// A vine spawned an instance
    VineAdded {
        /// The vine
        node: NodeId,
        /// Instance identity
        instance: InstanceId,
        /// Template arguments
        args: Value,
        /// First replicable id of the instance subtree
        base: NodeId,
        /// Owning actor, if any
        owner: Option<Actor>,
    },
    /// A vine dropped an instance
    VineRemoved {
        /// The vine
        node: NodeId,
        /// Instance identity
        instance: InstanceId,
    },
}

impl Packet {
    /// Attach a node identity to an unsigned packet.
    #[must_use]
    pub fn sign(node: NodeId, packet: UnsignedPacket) -> Self {
        match packet {
            UnsignedPacket::Update(value) => Packet::Update { node, value },
            UnsignedPacket::Subscribe => Packet::Subscribe { node },
            UnsignedPacket::Unsubscribe => Packet::Unsubscribe { node },
            UnsignedPacket::VineAdded {
                instance,
                args,
                base,
                owner,
            } => Packet::VineAdded {
                node,
                instance,
                args,
                base,
                owner,
            },
            UnsignedPacket::VineRemoved { instance } => Packet::VineRemoved { node, instance },
        }
    }

    /// The node this packet addresses, `None` for handshakes.
    #[must_use]
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Packet::Handshake(_) => None,
            Packet::Update { node, .. }
            | Packet::Subscribe { node }
            | Packet::Unsubscribe { node }
            | Packet::VineAdded { node, .. }
            | Packet::VineRemoved { node, .. } => Some(*node),
        }
    }

    /// Short variant name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake(_) => "handshake",
            Packet::Update { .. } => "update",
            Packet::Subscribe { .. } => "subscribe",
            Packet::Unsubscribe { .. } => "unsubscribe",
            Packet::VineAdded { .. } => "vine-added",
            Packet::VineRemoved { .. } => "vine-removed",
        }
    }
}

/// A signed packet with its destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct Signed {
    /// Destination actors
    pub targets: Vec<Actor>,
    /// The packet
    pub packet: Packet,
}

impl Signed {
    /// Sign a queued packet with the identity of the node that produced it.
    #[must_use]
    pub fn new(node: NodeId, wrapped: Wrapped) -> Self {
        Self {
            targets: wrapped.targets,
            packet: Packet::sign(node, wrapped.packet),
        }
    }

    /// A handshake addressed to the server.
    #[must_use]
    pub fn handshake(fingerprint: Fingerprint) -> Self {
        Self {
            targets: vec![Actor::Server],
            packet: Packet::Handshake(fingerprint),
        }
    }
}

/// Sign every packet drained from a tree.
#[must_use]
pub fn sign_all(drained: Vec<(NodeId, Wrapped)>) -> Vec<Signed> {
    drained
        .into_iter()
        .map(|(node, wrapped)| Signed::new(node, wrapped))
        .collect()
}
