//! Vine instance lifecycle.
//!
//! The owner materializes instances from the vine template and announces them
//! with the first replicable id of the new subtree. Mirrors materialize the same
//! template from the same arguments at the announced ids.

use super::{survey, StateTree};
use crate::actor::Actor;
use crate::error::TreeError;
use crate::node::{
    Definition, InstanceId, NodeId, NodeKey, NodeKind, NodeStatus, SubscriptionId, VineEvent,
    VineInstance, VineTemplate,
};
use crate::replicator::UnsignedPacket;
use crate::scope::ScopeIndex;
use serde_json::Value;
use std::collections::HashSet;

struct VineParts {
    scope: ScopeIndex,
    template: VineTemplate,
    owner: Option<Actor>,
}

impl StateTree {
    fn vine_parts(&self, key: NodeKey) -> Result<VineParts, TreeError> {
        let node = self.require(key)?;
        match &node.kind {
            NodeKind::Vine(vine) => Ok(VineParts {
                scope: node.scope(),
                template: vine.template.clone(),
                owner: node.instance_owner,
            }),
            _ => Err(self.wrong_kind(key, "vine")),
        }
    }

    fn vine_instance(&self, key: NodeKey, instance: InstanceId) -> Option<&VineInstance> {
        match self.node(key).map(|n| &n.kind) {
            Some(NodeKind::Vine(vine)) => vine.instances.get(&instance),
            _ => None,
        }
    }

    /// Live instances of a vine, ordered by identity.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine.
    pub fn instances(&self, key: NodeKey) -> Result<Vec<(InstanceId, NodeKey)>, TreeError> {
        match &self.require(key)?.kind {
            NodeKind::Vine(vine) => Ok(vine.instances.iter().map(|(id, i)| (*id, i.key)).collect()),
            _ => Err(self.wrong_kind(key, "vine")),
        }
    }

    /// The instance of `key` owned by `actor`, if any.
    #[must_use]
    pub fn instance_owned_by(&self, key: NodeKey, actor: &Actor) -> Option<InstanceId> {
        match self.node(key).map(|n| &n.kind) {
            Some(NodeKind::Vine(vine)) => vine
                .instances
                .iter()
                .find(|(_, instance)| instance.owner.as_ref() == Some(actor))
                .map(|(id, _)| *id),
            _ => None,
        }
    }

    /// Owned vines that keep one instance per connected client.
    #[must_use]
    pub fn per_actor_vines(&self) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                let node = node.as_ref()?;
                match &node.kind {
                    NodeKind::Vine(vine) if vine.per_actor && self.ctx.is_owner(node.scope()) => {
                        Some(NodeKey(index))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Listen for instance changes on a vine. Triggers a subscribe to the
    /// owner if not yet consistent.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine and `Unreadable` if the
    /// local role may not read it.
    pub fn subscribe_vine<F>(
        &mut self,
        key: NodeKey,
        listener: F,
    ) -> Result<SubscriptionId, TreeError>
    where
        F: FnMut(VineEvent) + Send + 'static,
    {
        let VineParts { scope, .. } = self.vine_parts(key)?;
        if !self.ctx.can_read(scope) {
            return Err(TreeError::Unreadable {
                path: self.full_name(key),
                scope,
            });
        }
        let id = self.allocate_subscription(key);
        if let Some(NodeKind::Vine(vine)) = self.node_mut(key).map(|n| &mut n.kind) {
            vine.listeners.push((id, Box::new(listener)));
        }
        self.begin_subscribe(key);
        Ok(id)
    }

    /// Build an instance subtree under `key`.
    ///
    /// With `base` unset, ids are allocated past every id in use.
    fn instantiate(
        &mut self,
        key: NodeKey,
        instance: InstanceId,
        args: &Value,
        owner: Option<Actor>,
        base: Option<NodeId>,
    ) -> Result<(NodeKey, Option<NodeId>), TreeError> {
        let VineParts { scope, template, .. } = self.vine_parts(key)?;
        let def = Definition::Branch {
            scope: None,
            children: template(args)?,
        };
        let path = format!("{}/[{instance}]", self.full_name(key));
        let count = survey(&def, scope, &path)?;

        let base = match base {
            Some(base) => {
                for offset in 0..count {
                    let id = NodeId(base.0.saturating_add(offset));
                    if self.replicable.contains_key(&id) {
                        return Err(TreeError::NodeIdCollision(id));
                    }
                }
                Some(base)
            }
            None => (count > 0).then_some(NodeId(self.next_dynamic_id)),
        };

        let mut next = base.map_or(self.next_dynamic_id, |b| b.0);
        let root = self.materialize(instance.to_string(), def, Some(key), scope, owner, &mut next);
        self.next_dynamic_id = self.next_dynamic_id.max(next);
        if let Some(NodeKind::Branch(branch)) = self.node_mut(root).map(|n| &mut n.kind) {
            branch.instance = Some(instance);
        }
        Ok((root, base))
    }

    fn record_instance(&mut self, key: NodeKey, instance: InstanceId, record: VineInstance) {
        if let Some(NodeKind::Vine(vine)) = self.node_mut(key).map(|n| &mut n.kind) {
            vine.next_instance = vine.next_instance.max(instance.0 + 1);
            vine.instances.insert(instance, record);
        }
    }

    fn emit(&mut self, key: NodeKey, event: VineEvent) {
        if let Some(NodeKind::Vine(vine)) = self.node_mut(key).map(|n| &mut n.kind) {
            for (_, listener) in &mut vine.listeners {
                listener(event);
            }
        }
        self.notify(key);
    }

    /// Spawn an instance as the owner and announce it to the vine's targets.
    ///
    /// Every actor the announcement targets is subscribed to the new subtree.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine, `NotOwner` if the local
    /// role does not own it, `DuplicateKey` if the template repeats a key, and
    /// `Value` if the template refuses the arguments.
    pub fn vine_add(
        &mut self,
        key: NodeKey,
        args: Value,
        owner: Option<Actor>,
    ) -> Result<(InstanceId, NodeKey), TreeError> {
        let parts = self.vine_parts(key)?;
        if !self.acts_as_owner(parts.scope) {
            return Err(TreeError::NotOwner {
                path: self.full_name(key),
                scope: parts.scope,
            });
        }
        let owner = owner.or(parts.owner);
        let instance = match self.node(key).map(|n| &n.kind) {
            Some(NodeKind::Vine(vine)) => InstanceId(vine.next_instance),
            _ => return Err(self.wrong_kind(key, "vine")),
        };

        let (root, base) = self.instantiate(key, instance, &args, owner, None)?;
        self.record_instance(
            key,
            instance,
            VineInstance {
                key: root,
                args: args.clone(),
                base,
                owner,
            },
        );

        let mut announced = Vec::new();
        if let Some(node) = self.node_mut(key) {
            if let Some(base) = base.filter(|_| parts.scope.replicates()) {
                announced = node.replicator.target_actors();
                node.replicator.enqueue(
                    announced.clone(),
                    UnsignedPacket::VineAdded {
                        instance,
                        args,
                        base,
                        owner,
                    },
                );
            }
        }
        // Only actors told about the instance may receive its values.
        for actor in announced {
            self.subscribe_actor(root, actor)?;
        }

        self.emit(key, VineEvent::Added { instance, key: root });
        tracing::info!(vine = %self.full_name(key), %instance, "Added vine instance");
        Ok((instance, root))
    }

    /// Remove an instance as the owner and announce the removal.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine, `NotOwner` if the local
    /// role does not own it, and `UnknownInstance` if there is no such instance.
    pub fn vine_remove(&mut self, key: NodeKey, instance: InstanceId) -> Result<(), TreeError> {
        let parts = self.vine_parts(key)?;
        if !self.acts_as_owner(parts.scope) {
            return Err(TreeError::NotOwner {
                path: self.full_name(key),
                scope: parts.scope,
            });
        }
        if !self.detach_instance(key, instance) {
            return Err(TreeError::UnknownInstance {
                path: self.full_name(key),
                instance,
            });
        }
        if parts.scope.replicates() {
            if let Some(node) = self.node_mut(key) {
                let targets = node.replicator.target_actors();
                node.replicator
                    .enqueue(targets, UnsignedPacket::VineRemoved { instance });
            }
        }
        self.emit(key, VineEvent::Removed { instance });
        tracing::info!(vine = %self.full_name(key), %instance, "Removed vine instance");
        Ok(())
    }

    /// Materialize an instance announced by the owner.
    ///
    /// Repeated announcements of a known instance are ignored. New nodes start
    /// `Subscribing` when the vine itself is subscribed.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine, `NodeIdCollision` if the
    /// announced ids are in use, `DuplicateKey` if the template repeats a key,
    /// and `Value` if the template refuses the arguments.
    pub fn apply_vine_added(
        &mut self,
        key: NodeKey,
        instance: InstanceId,
        args: Value,
        base: NodeId,
        owner: Option<Actor>,
    ) -> Result<NodeKey, TreeError> {
        let parts = self.vine_parts(key)?;
        if let Some(existing) = self.vine_instance(key, instance) {
            return Ok(existing.key);
        }

        let (root, _) = self.instantiate(key, instance, &args, owner.or(parts.owner), Some(base))?;
        let vine_status = self.status(key).unwrap_or(NodeStatus::Inconsistent);
        if vine_status != NodeStatus::Inconsistent {
            for k in self.descendants(root) {
                if let Some(node) = self.node_mut(k) {
                    if node.status == NodeStatus::Inconsistent {
                        node.status = NodeStatus::Subscribing;
                    }
                }
            }
        }
        self.record_instance(
            key,
            instance,
            VineInstance {
                key: root,
                args,
                base: Some(base),
                owner,
            },
        );
        self.emit(key, VineEvent::Added { instance, key: root });
        tracing::debug!(vine = %self.full_name(key), %instance, %base, "Mirrored vine instance");
        Ok(root)
    }

    /// Drop an instance the owner removed. Returns `false` if it was unknown.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` if the node is not a vine.
    pub fn apply_vine_removed(
        &mut self,
        key: NodeKey,
        instance: InstanceId,
    ) -> Result<bool, TreeError> {
        self.vine_parts(key)?;
        if !self.detach_instance(key, instance) {
            return Ok(false);
        }
        self.emit(key, VineEvent::Removed { instance });
        tracing::debug!(vine = %self.full_name(key), %instance, "Dropped mirrored vine instance");
        Ok(true)
    }

    /// Remove an instance record and its subtree. Pending reads beneath it
    /// resolve as cancelled.
    fn detach_instance(&mut self, key: NodeKey, instance: InstanceId) -> bool {
        let removed = match self.node_mut(key).map(|n| &mut n.kind) {
            Some(NodeKind::Vine(vine)) => vine.instances.remove(&instance),
            _ => None,
        };
        let Some(removed) = removed else {
            return false;
        };

        let keys = self.descendants(removed.key);
        let gone: HashSet<NodeKey> = keys.iter().copied().collect();
        for k in keys {
            let Some(node) = self.release_slot(k) else {
                continue;
            };
            if let Some(id) = node.id {
                self.replicable.remove(&id);
            }
            for actor in node.replicator.subscribers() {
                if let Some(keys) = self.by_actor.get_mut(actor) {
                    keys.remove(&k);
                }
            }
        }
        self.by_actor.retain(|_, keys| !keys.is_empty());
        self.subscriptions.retain(|_, k| !gone.contains(k));
        self.requested.retain(|k| !gone.contains(k));
        true
    }
}
