//! Owner-side subscriber bookkeeping and id-addressed packet handlers.

use super::{SetOutcome, StateTree};
use crate::actor::Actor;
use crate::error::TreeError;
use crate::node::{InstanceId, NodeId, NodeKey, NodeKind};
use crate::replicator::UnsignedPacket;
use serde_json::Value;
use std::collections::BTreeSet;

impl StateTree {
    /// Subscribe a remote actor to a node the local role owns.
    ///
    /// Leaves immediately queue their current value for `actor` alone, branches
    /// recurse, and vines announce their existing instances before recursing
    /// into them. Nested non-replicating scopes are skipped.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` if the local role does not own the node.
    pub fn subscribe_actor(&mut self, key: NodeKey, actor: Actor) -> Result<(), TreeError> {
        let scope = self.require(key)?.scope();
        if !self.ctx.is_owner(scope) || !scope.replicates() {
            return Err(TreeError::NotOwner {
                path: self.full_name(key),
                scope,
            });
        }
        self.subscribe_subtree(key, actor);
        tracing::debug!(node = %self.full_name(key), %actor, "Subscribed actor");
        Ok(())
    }

    fn subscribe_subtree(&mut self, key: NodeKey, actor: Actor) {
        let Some(node) = self.node_mut(key) else { return };
        if !node.scope().replicates() {
            return;
        }
        node.replicator.add_subscriber(actor);
        match &node.kind {
            NodeKind::Leaf(leaf) => {
                if let Some(value) = leaf.value.clone() {
                    node.replicator
                        .enqueue(vec![actor], UnsignedPacket::Update(value));
                }
            }
            NodeKind::Branch(_) => {}
            NodeKind::Vine(vine) => {
                let announcements: Vec<UnsignedPacket> = vine
                    .instances
                    .iter()
                    .filter_map(|(instance, record)| {
                        record.base.map(|base| UnsignedPacket::VineAdded {
                            instance: *instance,
                            args: record.args.clone(),
                            base,
                            owner: record.owner,
                        })
                    })
                    .collect();
                for packet in announcements {
                    node.replicator.enqueue(vec![actor], packet);
                }
            }
        }
        let children = node.kind.child_keys();
        self.by_actor.entry(actor).or_default().insert(key);
        for child in children {
            self.subscribe_subtree(child, actor);
        }
    }

    /// Stop replicating a subtree the local role owns to `actor`. Returns the
    /// number of nodes it was removed from.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` if the local role does not own the node.
    pub fn unsubscribe_actor(&mut self, key: NodeKey, actor: &Actor) -> Result<usize, TreeError> {
        let scope = self.require(key)?.scope();
        if !self.ctx.is_owner(scope) || !scope.replicates() {
            return Err(TreeError::NotOwner {
                path: self.full_name(key),
                scope,
            });
        }
        let mut removed = 0;
        for k in self.descendants(key) {
            if let Some(node) = self.node_mut(k) {
                if node.replicator.remove_subscriber(actor) {
                    removed += 1;
                }
            }
            if let Some(keys) = self.by_actor.get_mut(actor) {
                keys.remove(&k);
            }
        }
        if self.by_actor.get(actor).is_some_and(BTreeSet::is_empty) {
            self.by_actor.remove(actor);
        }
        tracing::debug!(node = %self.full_name(key), %actor, nodes = removed, "Unsubscribed actor");
        Ok(removed)
    }

    /// Forget a departed actor everywhere it was subscribed. Returns the
    /// number of nodes it was removed from.
    pub fn remove_actor(&mut self, actor: &Actor) -> usize {
        let Some(keys) = self.by_actor.remove(actor) else {
            return 0;
        };
        for key in &keys {
            if let Some(node) = self.node_mut(*key) {
                node.replicator.remove_subscriber(actor);
            }
        }
        tracing::debug!(%actor, nodes = keys.len(), "Removed actor subscriptions");
        keys.len()
    }

    /// Number of nodes `actor` is subscribed to.
    #[must_use]
    pub fn subscription_count(&self, actor: &Actor) -> usize {
        self.by_actor.get(actor).map_or(0, BTreeSet::len)
    }

    fn key_for(&self, id: NodeId) -> Result<NodeKey, TreeError> {
        self.key_of(id).ok_or(TreeError::UnknownNodeId(id))
    }

    /// Apply an inbound update addressed by id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeId`, `WrongKind` for non-leaves, or `Unauthorized`.
    pub fn apply_update(
        &mut self,
        id: NodeId,
        value: Value,
        source: Actor,
    ) -> Result<SetOutcome, TreeError> {
        let key = self.key_for(id)?;
        self.set_from(key, value, source)
    }

    /// Apply an inbound subscribe addressed by id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeId` or `NotOwner`.
    pub fn apply_subscribe(&mut self, id: NodeId, source: Actor) -> Result<(), TreeError> {
        let key = self.key_for(id)?;
        self.subscribe_actor(key, source)
    }

    /// Apply an inbound unsubscribe addressed by id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeId` or `NotOwner`.
    pub fn apply_unsubscribe(&mut self, id: NodeId, source: Actor) -> Result<usize, TreeError> {
        let key = self.key_for(id)?;
        self.unsubscribe_actor(key, &source)
    }

    /// Apply an inbound instance announcement addressed by vine id.
    ///
    /// # Errors
    ///
    /// See [`StateTree::apply_vine_added`].
    pub fn apply_vine_added_by_id(
        &mut self,
        id: NodeId,
        instance: InstanceId,
        args: Value,
        base: NodeId,
        owner: Option<Actor>,
    ) -> Result<NodeKey, TreeError> {
        let key = self.key_for(id)?;
        self.apply_vine_added(key, instance, args, base, owner)
    }

    /// Apply an inbound instance removal addressed by vine id.
    ///
    /// # Errors
    ///
    /// See [`StateTree::apply_vine_removed`].
    pub fn apply_vine_removed_by_id(
        &mut self,
        id: NodeId,
        instance: InstanceId,
    ) -> Result<bool, TreeError> {
        let key = self.key_for(id)?;
        self.apply_vine_removed(key, instance)
    }
}
