//! The arena-backed state tree.
//!
//! Nodes live in a flat arena indexed by [`NodeKey`]; parents are plain keys.
//! Building walks the definitions once in pre-order, switching scope at every
//! declared boundary and numbering replicable nodes as it goes, so two
//! processes building the same definitions agree on every [`NodeId`].

mod inbound;
mod leaf;
mod vine;

pub use leaf::SetOutcome;

use crate::actor::{Actor, ReplicaContext};
use crate::error::TreeError;
use crate::node::{
    BranchNode, Definition, Fingerprint, LeafNode, Node, NodeId, NodeKey, NodeKind, NodeStatus,
    SubscriptionId, VineNode,
};
use crate::path::{NodePath, PathSegment};
use crate::replicator::{ReplicationMode, Replicator, UnsignedPacket, Wrapped};
use crate::scope::ScopeIndex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A built state tree for one role.
pub struct StateTree {
    ctx: ReplicaContext,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeKey>,
    roots: Vec<(String, NodeKey)>,
    replicable: BTreeMap<NodeId, NodeKey>,
    fingerprint: Fingerprint,
    next_dynamic_id: u32,
    by_actor: HashMap<Actor, BTreeSet<NodeKey>>,
    requested: BTreeSet<NodeKey>,
    subscriptions: HashMap<SubscriptionId, NodeKey>,
    next_subscription: u64,
    next_ticket: u64,
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("role", &self.ctx.role)
            .field("nodes", &self.len())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Validate a definition and count the replicable nodes it would create.
pub(crate) fn survey(
    def: &Definition,
    inherited: ScopeIndex,
    path: &str,
) -> Result<u32, TreeError> {
    let scope = def.declared_scope().unwrap_or(inherited);
    let own = u32::from(scope.replicates());
    match def {
        Definition::Leaf { .. } | Definition::Vine { .. } => Ok(own),
        Definition::Branch { children, .. } => {
            let mut seen = HashSet::new();
            let mut total = own;
            for (name, child) in children {
                if !seen.insert(name.as_str()) {
                    return Err(TreeError::DuplicateKey {
                        parent: path.to_string(),
                        key: name.clone(),
                    });
                }
                total += survey(child, scope, &format!("{path}/{name}"))?;
            }
            Ok(total)
        }
    }
}

impl StateTree {
    /// Build a tree from root definitions in declaration order.
    ///
    /// Roots without a declared scope are `Unassigned`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if two siblings share a name.
    pub fn build<K, I>(roots: I, ctx: ReplicaContext) -> Result<Self, TreeError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        let roots: Vec<(String, Definition)> =
            roots.into_iter().map(|(k, d)| (k.into(), d)).collect();

        let mut seen = HashSet::new();
        for (name, def) in &roots {
            if !seen.insert(name.as_str()) {
                return Err(TreeError::DuplicateKey {
                    parent: String::new(),
                    key: name.clone(),
                });
            }
            survey(def, ScopeIndex::Unassigned, name)?;
        }

        let last_root = roots.last().map(|(name, _)| name.clone()).unwrap_or_default();
        let mut tree = Self {
            ctx,
            nodes: Vec::new(),
            free: Vec::new(),
            roots: Vec::with_capacity(roots.len()),
            replicable: BTreeMap::new(),
            fingerprint: Fingerprint {
                node_count: 0,
                last_root,
            },
            next_dynamic_id: 0,
            by_actor: HashMap::new(),
            requested: BTreeSet::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
            next_ticket: 0,
        };

        let mut next_id = 0;
        for (name, def) in roots {
            let key = tree.materialize(
                name.clone(),
                def,
                None,
                ScopeIndex::Unassigned,
                None,
                &mut next_id,
            );
            tree.roots.push((name, key));
        }
        tree.fingerprint.node_count = next_id;
        tree.next_dynamic_id = next_id;

        tracing::info!(
            role = %ctx.role,
            nodes = tree.len(),
            replicable = next_id,
            last_root = %tree.fingerprint.last_root,
            "Built state tree"
        );
        Ok(tree)
    }

    /// Insert a surveyed definition. Ids are taken from `next_id` in pre-order.
    pub(crate) fn materialize(
        &mut self,
        name: String,
        def: Definition,
        parent: Option<NodeKey>,
        inherited: ScopeIndex,
        owner: Option<Actor>,
        next_id: &mut u32,
    ) -> NodeKey {
        let scope = def.declared_scope().unwrap_or(inherited);
        let key = self.allocate_slot();
        let id = scope.replicates().then(|| {
            let id = NodeId(*next_id);
            *next_id += 1;
            self.replicable.insert(id, key);
            id
        });
        let status = if self.acts_as_owner(scope) {
            NodeStatus::Consistent
        } else {
            NodeStatus::Inconsistent
        };

        let (kind, children) = match def {
            Definition::Leaf { initial } => (
                NodeKind::Leaf(LeafNode {
                    value: initial,
                    ..LeafNode::default()
                }),
                Vec::new(),
            ),
            Definition::Branch {
                scope: declared,
                children,
            } => (
                NodeKind::Branch(BranchNode {
                    declared_scope: declared,
                    ..BranchNode::default()
                }),
                children,
            ),
            Definition::Vine {
                per_actor, template, ..
            } => (
                NodeKind::Vine(VineNode {
                    template,
                    per_actor,
                    instances: BTreeMap::new(),
                    next_instance: 0,
                    listeners: Vec::new(),
                    observers: Vec::new(),
                }),
                Vec::new(),
            ),
        };

        if let Some(slot) = self.nodes.get_mut(key.0) {
            *slot = Some(Node {
                name,
                parent,
                id,
                status,
                replicator: Replicator::new(scope),
                instance_owner: owner,
                kind,
            });
        }

        for (child_name, child_def) in children {
            let child = self.materialize(
                child_name.clone(),
                child_def,
                Some(key),
                scope,
                owner,
                next_id,
            );
            if let Some(NodeKind::Branch(branch)) = self.node_mut(key).map(|n| &mut n.kind) {
                branch.children.push((child_name, child));
            }
        }
        key
    }

    /// Reuse a slot freed by a removed instance, or grow the arena.
    fn allocate_slot(&mut self) -> NodeKey {
        if let Some(key) = self.free.pop() {
            return key;
        }
        self.nodes.push(None);
        NodeKey(self.nodes.len() - 1)
    }

    /// Empty a slot and make it available to the next instance.
    pub(crate) fn release_slot(&mut self, key: NodeKey) -> Option<Node> {
        let node = self.nodes.get_mut(key.0).and_then(Option::take)?;
        self.free.push(key);
        Some(node)
    }

    /// The local role and actor.
    #[must_use]
    pub fn context(&self) -> &ReplicaContext {
        &self.ctx
    }

    /// Structural fingerprint taken at build time.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Whether the tree has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live node.
    #[must_use]
    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key.0).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key.0).and_then(Option::as_mut)
    }

    pub(crate) fn require(&self, key: NodeKey) -> Result<&Node, TreeError> {
        self.node(key).ok_or(TreeError::UnknownNode)
    }

    pub(crate) fn require_mut(&mut self, key: NodeKey) -> Result<&mut Node, TreeError> {
        self.node_mut(key).ok_or(TreeError::UnknownNode)
    }

    pub(crate) fn wrong_kind(&self, key: NodeKey, expected: &'static str) -> TreeError {
        TreeError::WrongKind {
            path: self.full_name(key),
            expected,
            actual: self.node(key).map_or("missing", |n| n.kind.name()),
        }
    }

    /// Root nodes in declaration order.
    pub fn roots(&self) -> impl Iterator<Item = (&str, NodeKey)> {
        self.roots.iter().map(|(name, key)| (name.as_str(), *key))
    }

    /// The node carrying a replicable identity.
    #[must_use]
    pub fn key_of(&self, id: NodeId) -> Option<NodeKey> {
        self.replicable.get(&id).copied()
    }

    /// The replicable identity of a node.
    #[must_use]
    pub fn id_of(&self, key: NodeKey) -> Option<NodeId> {
        self.node(key).and_then(|n| n.id)
    }

    /// Every registered replicable identity, ascending.
    pub fn replicable_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicable.keys().copied()
    }

    /// Local consistency of a node.
    #[must_use]
    pub fn status(&self, key: NodeKey) -> Option<NodeStatus> {
        self.node(key).map(|n| n.status)
    }

    /// Whether the local role owns the node's scope.
    #[must_use]
    pub fn is_owned(&self, key: NodeKey) -> bool {
        self.node(key).is_some_and(|n| self.ctx.is_owner(n.scope()))
    }

    /// Non-replicating scopes have no remote owner to defer to.
    pub(crate) fn acts_as_owner(&self, scope: ScopeIndex) -> bool {
        self.ctx.is_owner(scope) || !scope.replicates()
    }

    /// Full path of a node.
    #[must_use]
    pub fn path(&self, key: NodeKey) -> NodePath {
        let mut segments = Vec::new();
        let mut current = Some(key);
        while let Some(k) = current {
            let Some(node) = self.node(k) else { break };
            let segment = match &node.kind {
                NodeKind::Branch(BranchNode {
                    instance: Some(instance),
                    ..
                }) => PathSegment::Instance(*instance),
                _ => PathSegment::Key(node.name.clone()),
            };
            segments.push(segment);
            current = node.parent;
        }
        segments.reverse();
        NodePath::from_segments(segments)
    }

    /// Full path of a node rendered for diagnostics.
    #[must_use]
    pub fn full_name(&self, key: NodeKey) -> String {
        self.path(key).to_string()
    }

    /// Find the node at `path`.
    ///
    /// # Errors
    ///
    /// Returns `PathNotFound` if any segment does not match.
    pub fn resolve(&self, path: impl Into<NodePath>) -> Result<NodeKey, TreeError> {
        let path = path.into();
        let not_found = || TreeError::PathNotFound(path.to_string());

        let mut segments = path.segments.iter();
        let Some(PathSegment::Key(first)) = segments.next() else {
            return Err(not_found());
        };
        let mut key = self
            .roots
            .iter()
            .find(|(name, _)| name == first)
            .map(|(_, key)| *key)
            .ok_or_else(not_found)?;

        for segment in segments {
            let node = self.require(key)?;
            key = match (&node.kind, segment) {
                (NodeKind::Branch(branch), PathSegment::Key(name)) => branch.child(name),
                (NodeKind::Vine(vine), PathSegment::Instance(instance)) => {
                    vine.instances.get(instance).map(|i| i.key)
                }
                _ => None,
            }
            .ok_or_else(not_found)?;
        }
        Ok(key)
    }

    /// JSON view of a subtree. Empty leaves render as `null`, vine instances
    /// are keyed by instance id.
    #[must_use]
    pub fn snapshot(&self, key: NodeKey) -> Value {
        let Some(node) = self.node(key) else {
            return Value::Null;
        };
        match &node.kind {
            NodeKind::Leaf(leaf) => leaf.value.clone().unwrap_or(Value::Null),
            NodeKind::Branch(branch) => Value::Object(
                branch
                    .children
                    .iter()
                    .map(|(name, child)| (name.clone(), self.snapshot(*child)))
                    .collect(),
            ),
            NodeKind::Vine(vine) => Value::Object(
                vine.instances
                    .iter()
                    .map(|(id, instance)| (id.to_string(), self.snapshot(instance.key)))
                    .collect(),
            ),
        }
    }

    /// Keys of a subtree in pre-order, `key` first.
    pub(crate) fn descendants(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            let Some(node) = self.node(k) else { continue };
            out.push(k);
            stack.extend(node.kind.child_keys().into_iter().rev());
        }
        out
    }

    /// Change how a node resolves its targets.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if the key is not live.
    pub fn set_mode(&mut self, key: NodeKey, mode: ReplicationMode) -> Result<(), TreeError> {
        self.require_mut(key)?.replicator.set_mode(mode);
        Ok(())
    }

    /// Take every queued packet, signed with its node identity, in id order.
    pub fn drain_outbound(&mut self) -> Vec<(NodeId, Wrapped)> {
        let ids: Vec<(NodeId, NodeKey)> =
            self.replicable.iter().map(|(id, key)| (*id, *key)).collect();
        let mut out = Vec::new();
        for (id, key) in ids {
            if let Some(node) = self.node_mut(key) {
                out.extend(node.replicator.drain().into_iter().map(|wrapped| (id, wrapped)));
            }
        }
        out
    }

    pub(crate) fn allocate_subscription(&mut self, key: NodeKey) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.insert(id, key);
        id
    }

    /// Observe a node. The callback receives a snapshot on every change at or
    /// below it. Triggers a subscribe to the owner if not yet consistent.
    ///
    /// # Errors
    ///
    /// Returns `Unreadable` if the local role may not read the node.
    pub fn subscribe<F>(&mut self, key: NodeKey, callback: F) -> Result<SubscriptionId, TreeError>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let scope = self.require(key)?.scope();
        if !self.ctx.can_read(scope) {
            return Err(TreeError::Unreadable {
                path: self.full_name(key),
                scope,
            });
        }
        let id = self.allocate_subscription(key);
        self.require_mut(key)?
            .kind
            .observers_mut()
            .push((id, Box::new(callback)));
        self.begin_subscribe(key);
        Ok(id)
    }

    /// Drop an observer or vine listener. Returns `false` if it was unknown.
    ///
    /// Once nothing local watches a subscribed mirror subtree any more, the
    /// owner is told to stop replicating it and the subtree returns to
    /// `Inconsistent`.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(key) = self.subscriptions.remove(&id) else {
            return false;
        };
        let Some(node) = self.node_mut(key) else {
            return false;
        };
        node.kind.observers_mut().retain(|(sub, _)| *sub != id);
        if let NodeKind::Vine(vine) = &mut node.kind {
            vine.listeners.retain(|(sub, _)| *sub != id);
        }
        self.release_if_unwatched(key);
        true
    }

    /// Keys from `key` up to its root, `key` first.
    fn ancestry(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut current = Some(key);
        while let Some(k) = current {
            let Some(node) = self.node(k) else { break };
            out.push(k);
            current = node.parent;
        }
        out
    }

    fn release_if_unwatched(&mut self, key: NodeKey) {
        let ancestry = self.ancestry(key);
        let Some(position) = ancestry.iter().rposition(|k| self.requested.contains(k)) else {
            return;
        };
        let root = ancestry[position];
        let watched = ancestry[position..]
            .iter()
            .chain(self.descendants(root).iter())
            .any(|k| self.node(*k).is_some_and(|n| n.kind.is_watched()));
        if watched {
            return;
        }

        for k in self.descendants(root) {
            self.requested.remove(&k);
            let mirrored = self.node(k).is_some_and(|n| !self.acts_as_owner(n.scope()));
            if let Some(node) = self.node_mut(k).filter(|_| mirrored) {
                node.status = NodeStatus::Inconsistent;
            }
        }
        if let Some(node) = self.node_mut(root) {
            node.replicator
                .enqueue(vec![Actor::Server], UnsignedPacket::Unsubscribe);
        }
        tracing::debug!(node = %self.full_name(root), "Unsubscribing from owner");
    }

    /// Move a non-owned node and its subtree to `Subscribing` and ask the
    /// server for it. No-op unless the node is still `Inconsistent`.
    pub(crate) fn begin_subscribe(&mut self, key: NodeKey) {
        let Some(node) = self.node(key) else { return };
        if node.status != NodeStatus::Inconsistent
            || node.id.is_none()
            || self.acts_as_owner(node.scope())
        {
            return;
        }
        for k in self.descendants(key) {
            if let Some(n) = self.node_mut(k) {
                if n.status == NodeStatus::Inconsistent {
                    n.status = NodeStatus::Subscribing;
                }
            }
        }
        if let Some(node) = self.node_mut(key) {
            node.replicator.enqueue(vec![Actor::Server], UnsignedPacket::Subscribe);
        }
        self.requested.insert(key);
        tracing::debug!(node = %self.full_name(key), "Subscribing to owner");
    }

    /// Fire observers on `key` and then on each ancestor.
    pub(crate) fn notify(&mut self, key: NodeKey) {
        let mut current = Some(key);
        while let Some(k) = current {
            let Some(node) = self.node(k) else { break };
            current = node.parent;
            if !node.kind.has_observers() {
                continue;
            }
            let snapshot = self.snapshot(k);
            if let Some(node) = self.node_mut(k) {
                for (_, observer) in node.kind.observers_mut() {
                    observer(&snapshot);
                }
            }
        }
    }
}
