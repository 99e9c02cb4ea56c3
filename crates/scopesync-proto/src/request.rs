//! The multiplexed wire request.
//!
//! One request per destination per tick carries every packet kind at once in
//! compact, index-aligned arrays. Empty fields are omitted on the wire.

use crate::packet::Packet;
use scopesync_core::{Actor, Fingerprint, InstanceId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An instance announcement on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VineAddEntry {
    /// The vine
    #[serde(rename = "n")]
    pub node: NodeId,
    /// Instance identity
    #[serde(rename = "i")]
    pub instance: InstanceId,
    /// Template arguments
    #[serde(rename = "a")]
    pub args: Value,
    /// First replicable id of the subtree
    #[serde(rename = "b")]
    pub base: NodeId,
    /// Owning actor
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Actor>,
}

/// An instance removal on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VineRemoveEntry {
    /// The vine
    #[serde(rename = "n")]
    pub node: NodeId,
    /// Instance identity
    #[serde(rename = "i")]
    pub instance: InstanceId,
}

/// A batched request to one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Updated node identities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<Vec<NodeId>>,
    /// Values, index-aligned with `u`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<Value>>,
    /// Subscribe requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<Vec<NodeId>>,
    /// Unsubscribe requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Vec<NodeId>>,
    /// Handshake: expected replicable-node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    /// Handshake: expected last root-node name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// Vine instance announcements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Vec<VineAddEntry>>,
    /// Vine instance removals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Vec<VineRemoveEntry>>,
}

fn push<T>(field: &mut Option<Vec<T>>, item: T) {
    field.get_or_insert_with(Vec::new).push(item);
}

impl NetworkRequest {
    /// Fold packets into one request. Packets of one kind keep their order; a
    /// later handshake replaces an earlier one.
    #[must_use]
    pub fn from_packets(packets: impl IntoIterator<Item = Packet>) -> Self {
        let mut request = Self::default();
        for packet in packets {
            match packet {
                Packet::Handshake(fingerprint) => {
                    request.h = Some(fingerprint.node_count);
                    request.n = Some(fingerprint.last_root);
                }
                Packet::Update { node, value } => {
                    push(&mut request.u, node);
                    push(&mut request.v, value);
                }
                Packet::Subscribe { node } => push(&mut request.s, node),
                Packet::Unsubscribe { node } => push(&mut request.r, node),
                Packet::VineAdded {
                    node,
                    instance,
                    args,
                    base,
                    owner,
                } => push(
                    &mut request.a,
                    VineAddEntry {
                        node,
                        instance,
                        args,
                        base,
                        owner,
                    },
                ),
                Packet::VineRemoved { node, instance } => {
                    push(&mut request.x, VineRemoveEntry { node, instance });
                }
            }
        }
        request
    }

    /// Split into packets in processing order: handshake, instance
    /// announcements, subscribes, unsubscribes, updates, instance removals.
    ///
    /// # Errors
    ///
    /// Returns `Misaligned` if `u` and `v` differ in length and
    /// `IncompleteHandshake` if only one of `h` and `n` is present.
    pub fn into_packets(self) -> Result<Vec<Packet>, MessageError> {
        let updates = self.u.unwrap_or_default();
        let values = self.v.unwrap_or_default();
        if updates.len() != values.len() {
            return Err(MessageError::Misaligned {
                updates: updates.len(),
                values: values.len(),
            });
        }

        let mut packets = Vec::new();
        match (self.h, self.n) {
            (Some(node_count), Some(last_root)) => {
                packets.push(Packet::Handshake(Fingerprint {
                    node_count,
                    last_root,
                }));
            }
            (None, None) => {}
            _ => return Err(MessageError::IncompleteHandshake),
        }

        packets.extend(self.a.unwrap_or_default().into_iter().map(|entry| Packet::VineAdded {
            node: entry.node,
            instance: entry.instance,
            args: entry.args,
            base: entry.base,
            owner: entry.owner,
        }));
        packets.extend(
            self.s
                .unwrap_or_default()
                .into_iter()
                .map(|node| Packet::Subscribe { node }),
        );
        packets.extend(
            self.r
                .unwrap_or_default()
                .into_iter()
                .map(|node| Packet::Unsubscribe { node }),
        );
        packets.extend(
            updates
                .into_iter()
                .zip(values)
                .map(|(node, value)| Packet::Update { node, value }),
        );
        packets.extend(
            self.x
                .unwrap_or_default()
                .into_iter()
                .map(|entry| Packet::VineRemoved {
                    node: entry.node,
                    instance: entry.instance,
                }),
        );
        Ok(packets)
    }

    /// Whether the request carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether the request carries handshake fields.
    #[must_use]
    pub fn has_handshake(&self) -> bool {
        self.h.is_some() || self.n.is_some()
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for request encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Update ids and values differ in length
    #[error("{updates} update ids but {values} values")]
    Misaligned {
        /// Number of ids
        updates: usize,
        /// Number of values
        values: usize,
    },
    /// Only one handshake field is present
    #[error("handshake requires both node count and last root name")]
    IncompleteHandshake,
}
