//! Node variants, identities, and tree definitions.

use crate::actor::Actor;
use crate::error::TreeError;
use crate::middleware::MiddlewareChain;
use crate::pending::PendingSlot;
use crate::replicator::Replicator;
use crate::scope::ScopeIndex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Index of a node inside the tree arena. Local to one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) usize);

/// Stable replicable identity, identical on both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a vine instance within its vine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Local consistency of a node relative to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// No value known to match the owner
    Inconsistent,
    /// Subscribe issued, first update not yet received
    Subscribing,
    /// Local value matches the owner
    Consistent,
}

/// Structural parity check exchanged in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Number of replicable nodes assigned at build time
    pub node_count: u32,
    /// Name of the last root-level node
    pub last_root: String,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} nodes, last root '{}'", self.node_count, self.last_root)
    }
}

/// Builds the children of a vine instance from its arguments.
pub type VineTemplate =
    Arc<dyn Fn(&Value) -> Result<Vec<(String, Definition)>, TreeError> + Send + Sync>;

/// Declarative description of a subtree.
#[derive(Clone)]
pub enum Definition {
    /// A value container
    Leaf {
        /// Value the leaf starts with
        initial: Option<Value>,
    },
    /// A fixed set of named children, optionally declaring a scope
    Branch {
        /// Scope declared at this boundary
        scope: Option<ScopeIndex>,
        /// Children in declaration order
        children: Vec<(String, Definition)>,
    },
    /// A factory of independently replicated instances
    Vine {
        /// Scope declared at this boundary
        scope: Option<ScopeIndex>,
        /// Whether one instance is kept per connected client
        per_actor: bool,
        /// Instance shape
        template: VineTemplate,
    },
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Definition::Leaf { initial } => {
                f.debug_struct("Leaf").field("initial", initial).finish()
            }
            Definition::Branch { scope, children } => f
                .debug_struct("Branch")
                .field("scope", scope)
                .field("children", children)
                .finish(),
            Definition::Vine { scope, per_actor, .. } => f
                .debug_struct("Vine")
                .field("scope", scope)
                .field("per_actor", per_actor)
                .finish_non_exhaustive(),
        }
    }
}

fn collect_children<K, I>(children: I) -> Vec<(String, Definition)>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Definition)>,
{
    children.into_iter().map(|(k, d)| (k.into(), d)).collect()
}

impl Definition {
    /// A leaf holding `initial`.
    #[must_use]
    pub fn leaf(initial: impl Into<Value>) -> Self {
        Definition::Leaf {
            initial: Some(initial.into()),
        }
    }

    /// A leaf with no value yet.
    #[must_use]
    pub fn empty_leaf() -> Self {
        Definition::Leaf { initial: None }
    }

    /// A branch inheriting its parent's scope.
    #[must_use]
    pub fn branch<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Definition::Branch {
            scope: None,
            children: collect_children(children),
        }
    }

    fn scoped<K, I>(scope: ScopeIndex, children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Definition::Branch {
            scope: Some(scope),
            children: collect_children(children),
        }
    }

    /// A server-owned subtree replicated to subscribers.
    #[must_use]
    pub fn public_server<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Self::scoped(ScopeIndex::PublicServer, children)
    }

    /// A server-owned subtree never leaving the server.
    #[must_use]
    pub fn private_server<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Self::scoped(ScopeIndex::PrivateServer, children)
    }

    /// A client-owned subtree never leaving the client.
    #[must_use]
    pub fn private_client<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Self::scoped(ScopeIndex::PrivateClient, children)
    }

    /// A server-owned subtree delivered on a need-to-know basis.
    #[must_use]
    pub fn need_to_know<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        Self::scoped(ScopeIndex::NeedToKnow, children)
    }

    /// A vine inheriting its parent's scope.
    #[must_use]
    pub fn vine<F>(template: F) -> Self
    where
        F: Fn(&Value) -> Vec<(String, Definition)> + Send + Sync + 'static,
    {
        Definition::Vine {
            scope: None,
            per_actor: false,
            template: Arc::new(move |args: &Value| -> Result<_, TreeError> { Ok(template(args)) }),
        }
    }

    /// A vine holding one publicly visible instance per connected client,
    /// writable by that client.
    #[must_use]
    pub fn public_client<F>(template: F) -> Self
    where
        F: Fn(Actor) -> Vec<(String, Definition)> + Send + Sync + 'static,
    {
        Definition::Vine {
            scope: Some(ScopeIndex::PublicClient),
            per_actor: true,
            template: Arc::new(move |args: &Value| -> Result<_, TreeError> {
                let actor = serde_json::from_value::<Actor>(args.clone())
                    .map_err(|e| TreeError::Value(format!("instance args are not an actor: {e}")))?;
                Ok(template(actor))
            }),
        }
    }

    /// The scope declared at this boundary, if any.
    #[must_use]
    pub fn declared_scope(&self) -> Option<ScopeIndex> {
        match self {
            Definition::Leaf { .. } => None,
            Definition::Branch { scope, .. } | Definition::Vine { scope, .. } => *scope,
        }
    }
}

/// Local observer of node snapshots.
pub(crate) type Observer = Box<dyn FnMut(&Value) + Send>;

/// Change notification for a vine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VineEvent {
    /// An instance was materialized
    Added {
        /// Instance identity
        instance: InstanceId,
        /// Root of the instance subtree
        key: NodeKey,
    },
    /// An instance was detached
    Removed {
        /// Instance identity
        instance: InstanceId,
    },
}

pub(crate) type VineListener = Box<dyn FnMut(VineEvent) + Send>;

/// Leaf state.
#[derive(Default)]
pub struct LeafNode {
    pub(crate) value: Option<Value>,
    pub(crate) middleware: MiddlewareChain,
    pub(crate) pending: Vec<PendingSlot>,
    pub(crate) observers: Vec<(SubscriptionId, Observer)>,
}

impl LeafNode {
    /// The local value.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Number of reads waiting for a value.
    #[must_use]
    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    /// The middleware chain.
    #[must_use]
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }
}

/// Branch state.
#[derive(Default)]
pub struct BranchNode {
    pub(crate) children: Vec<(String, NodeKey)>,
    pub(crate) declared_scope: Option<ScopeIndex>,
    pub(crate) instance: Option<InstanceId>,
    pub(crate) observers: Vec<(SubscriptionId, Observer)>,
}

impl BranchNode {
    /// Children in declaration order.
    pub fn children(&self) -> impl Iterator<Item = (&str, NodeKey)> {
        self.children.iter().map(|(name, key)| (name.as_str(), *key))
    }

    /// Look up a child by key.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<NodeKey> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, key)| *key)
    }

    /// The scope this branch declares, if it is a scope boundary.
    #[must_use]
    pub fn declared_scope(&self) -> Option<ScopeIndex> {
        self.declared_scope
    }

    /// The vine instance this branch is the root of, if any.
    #[must_use]
    pub fn instance(&self) -> Option<InstanceId> {
        self.instance
    }
}

/// A materialized vine instance.
#[derive(Debug, Clone)]
pub struct VineInstance {
    /// Root branch of the instance
    pub key: NodeKey,
    /// Arguments the template was materialized with
    pub args: Value,
    /// First replicable id of the subtree, if the vine replicates
    pub base: Option<NodeId>,
    /// Owning actor, if any
    pub owner: Option<Actor>,
}

/// Vine state.
pub struct VineNode {
    pub(crate) template: VineTemplate,
    pub(crate) per_actor: bool,
    pub(crate) instances: BTreeMap<InstanceId, VineInstance>,
    pub(crate) next_instance: u32,
    pub(crate) listeners: Vec<(SubscriptionId, VineListener)>,
    pub(crate) observers: Vec<(SubscriptionId, Observer)>,
}

impl VineNode {
    /// Live instances, ordered by identity.
    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, &VineInstance)> {
        self.instances.iter().map(|(id, instance)| (*id, instance))
    }

    /// Whether one instance is kept per connected client.
    #[must_use]
    pub fn per_actor(&self) -> bool {
        self.per_actor
    }
}

/// The closed set of node variants.
pub enum NodeKind {
    /// Value container
    Leaf(LeafNode),
    /// Fixed composite
    Branch(BranchNode),
    /// Instance factory
    Vine(VineNode),
}

impl NodeKind {
    /// Variant name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Branch(_) => "branch",
            NodeKind::Vine(_) => "vine",
        }
    }

    pub(crate) fn observers_mut(&mut self) -> &mut Vec<(SubscriptionId, Observer)> {
        match self {
            NodeKind::Leaf(leaf) => &mut leaf.observers,
            NodeKind::Branch(branch) => &mut branch.observers,
            NodeKind::Vine(vine) => &mut vine.observers,
        }
    }

    pub(crate) fn has_observers(&self) -> bool {
        match self {
            NodeKind::Leaf(leaf) => !leaf.observers.is_empty(),
            NodeKind::Branch(branch) => !branch.observers.is_empty(),
            NodeKind::Vine(vine) => !vine.observers.is_empty(),
        }
    }

    /// Whether a local observer, vine listener or open read waits on this node.
    pub(crate) fn is_watched(&self) -> bool {
        match self {
            NodeKind::Leaf(leaf) => {
                !leaf.observers.is_empty() || leaf.pending.iter().any(|s| !s.sender.is_closed())
            }
            NodeKind::Branch(branch) => !branch.observers.is_empty(),
            NodeKind::Vine(vine) => !vine.observers.is_empty() || !vine.listeners.is_empty(),
        }
    }

    /// Child keys in traversal order. Vine children are instance roots.
    pub(crate) fn child_keys(&self) -> Vec<NodeKey> {
        match self {
            NodeKind::Leaf(_) => Vec::new(),
            NodeKind::Branch(branch) => branch.children.iter().map(|(_, key)| *key).collect(),
            NodeKind::Vine(vine) => vine.instances.values().map(|instance| instance.key).collect(),
        }
    }
}

/// A node in the state tree arena.
pub struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) id: Option<NodeId>,
    pub(crate) status: NodeStatus,
    pub(crate) replicator: Replicator,
    pub(crate) instance_owner: Option<Actor>,
    pub(crate) kind: NodeKind,
}

impl Node {
    /// Name under the parent.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent node, `None` for roots.
    #[must_use]
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    /// Replicable identity, if the node replicates.
    #[must_use]
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    /// Local consistency.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Inherited scope.
    #[must_use]
    pub fn scope(&self) -> ScopeIndex {
        self.replicator.scope()
    }

    /// Owning actor of the enclosing vine instance, if any.
    #[must_use]
    pub fn instance_owner(&self) -> Option<&Actor> {
        self.instance_owner.as_ref()
    }

    /// Replication state.
    #[must_use]
    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Variant state.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}
