//! Per-node replication state.
//!
//! Every node carries a replicator holding its inherited scope, the actors
//! subscribed to it, how targets are chosen, and the unsigned packets it
//! produced during the current tick.

use crate::actor::Actor;
use crate::node::{InstanceId, NodeId};
use crate::scope::ScopeIndex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A predicate choosing which subscribers receive updates.
pub type ActorPredicate = Arc<dyn Fn(&Actor) -> bool + Send + Sync>;

/// How a replicator resolves its target actors.
#[derive(Clone, Default)]
pub enum ReplicationMode {
    /// Every subscriber
    #[default]
    All,
    /// Nobody
    None,
    /// Subscribers for which the predicate currently holds
    Predicate(ActorPredicate),
}

impl std::fmt::Debug for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::All => write!(f, "All"),
            ReplicationMode::None => write!(f, "None"),
            ReplicationMode::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// A packet not yet bound to a node identity.
#[derive(Debug, Clone, PartialEq)]
pub enum UnsignedPacket {
    /// New value for a leaf
    Update(Value),
    /// Request to be subscribed to a node
    Subscribe,
    /// The sender no longer observes a node
    Unsubscribe,
    /// A vine spawned an instance
    VineAdded {
        /// Instance identity within the vine
        instance: InstanceId,
        /// Arguments the template is materialized with
        args: Value,
        /// First replicable id of the instance subtree
        base: NodeId,
        /// Actor owning the instance, if any
        owner: Option<Actor>,
    },
    /// A vine dropped an instance
    VineRemoved {
        /// Instance identity within the vine
        instance: InstanceId,
    },
}

/// An unsigned packet with its destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct Wrapped {
    /// Destination actors
    pub targets: Vec<Actor>,
    /// The packet
    pub packet: UnsignedPacket,
}

/// Replication state attached to a single node.
#[derive(Debug, Clone, Default)]
pub struct Replicator {
    scope: ScopeIndex,
    mode: ReplicationMode,
    subscribers: BTreeSet<Actor>,
    queue: Vec<Wrapped>,
}

impl Replicator {
    /// Create a replicator for a node in `scope`.
    #[must_use]
    pub fn new(scope: ScopeIndex) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    /// The inherited scope.
    #[must_use]
    pub fn scope(&self) -> ScopeIndex {
        self.scope
    }

    /// The target resolution mode.
    #[must_use]
    pub fn mode(&self) -> &ReplicationMode {
        &self.mode
    }

    /// Change the target resolution mode.
    pub fn set_mode(&mut self, mode: ReplicationMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Add a subscriber. Returns `true` if it was not yet subscribed.
    pub fn add_subscriber(&mut self, actor: Actor) -> bool {
        self.subscribers.insert(actor)
    }

    /// Remove a subscriber. Returns `true` if it was subscribed.
    pub fn remove_subscriber(&mut self, actor: &Actor) -> bool {
        self.subscribers.remove(actor)
    }

    /// Whether `actor` is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, actor: &Actor) -> bool {
        self.subscribers.contains(actor)
    }

    /// All subscribers, in a stable order.
    pub fn subscribers(&self) -> impl Iterator<Item = &Actor> {
        self.subscribers.iter()
    }

    /// Resolve the current target actors.
    ///
    /// Predicates are evaluated on every call.
    #[must_use]
    pub fn target_actors(&self) -> Vec<Actor> {
        match &self.mode {
            ReplicationMode::All => self.subscribers.iter().copied().collect(),
            ReplicationMode::None => Vec::new(),
            ReplicationMode::Predicate(predicate) => self
                .subscribers
                .iter()
                .filter(|actor| predicate(actor))
                .copied()
                .collect(),
        }
    }

    /// Queue a packet for the given targets. Empty target lists are dropped.
    pub fn enqueue(&mut self, targets: Vec<Actor>, packet: UnsignedPacket) {
        if targets.is_empty() {
            return;
        }
        self.queue.push(Wrapped { targets, packet });
    }

    /// Queue a value update for every target except `source`.
    pub fn distribute_update(&mut self, value: Value, source: &Actor) {
        let targets = self
            .target_actors()
            .into_iter()
            .filter(|actor| actor != source)
            .collect();
        self.enqueue(targets, UnsignedPacket::Update(value));
    }

    /// Packets queued this tick, in enqueue order.
    #[must_use]
    pub fn queued(&self) -> &[Wrapped] {
        &self.queue
    }

    /// Take every queued packet, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Wrapped> {
        std::mem::take(&mut self.queue)
    }
}
