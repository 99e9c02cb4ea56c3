//! Leaf reads, writes, and middleware.

use super::StateTree;
use crate::actor::Actor;
use crate::error::TreeError;
use crate::middleware::{Middleware, MiddlewareChain, MiddlewareKind};
use crate::node::{LeafNode, NodeKey, NodeKind, NodeStatus};
use crate::pending::{GetTicket, PendingGet};
use crate::replicator::UnsignedPacket;
use crate::scope::ScopeIndex;
use serde_json::Value;

/// Result of a permitted write.
#[derive(Debug, Clone, PartialEq)]
pub enum SetOutcome {
    /// The value was applied locally
    Applied,
    /// The value was applied provisionally and sent to the owner
    Forwarded,
    /// A middleware refused the value; the leaf kept `retained`
    Rejected {
        /// Name of the failing middleware
        middleware: String,
        /// Its failure reaction
        kind: MiddlewareKind,
        /// The value the leaf still holds
        retained: Option<Value>,
    },
}

impl SetOutcome {
    /// Whether the value took effect locally.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, SetOutcome::Applied | SetOutcome::Forwarded)
    }
}

impl StateTree {
    fn leaf(&self, key: NodeKey) -> Result<&LeafNode, TreeError> {
        match &self.require(key)?.kind {
            NodeKind::Leaf(leaf) => Ok(leaf),
            _ => Err(self.wrong_kind(key, "leaf")),
        }
    }

    fn leaf_mut(&mut self, key: NodeKey) -> Option<&mut LeafNode> {
        match self.node_mut(key).map(|n| &mut n.kind) {
            Some(NodeKind::Leaf(leaf)) => Some(leaf),
            _ => None,
        }
    }

    fn readable_scope(&self, key: NodeKey) -> Result<ScopeIndex, TreeError> {
        let scope = self.require(key)?.scope();
        if self.ctx.can_read(scope) {
            Ok(scope)
        } else {
            Err(TreeError::Unreadable {
                path: self.full_name(key),
                scope,
            })
        }
    }

    /// The locally held value, without subscribing.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for non-leaves and `Unreadable` if the local role
    /// may not read the node.
    pub fn value(&self, key: NodeKey) -> Result<Option<&Value>, TreeError> {
        let leaf = self.leaf(key)?;
        self.readable_scope(key)?;
        Ok(leaf.value.as_ref())
    }

    /// Read a leaf.
    ///
    /// The owner resolves immediately when it holds a value. A mirror that is
    /// not yet consistent subscribes on the first call and every call waits
    /// for the owner's first update.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for non-leaves and `Unreadable` if the local role
    /// may not read the node.
    pub fn get(&mut self, key: NodeKey) -> Result<PendingGet, TreeError> {
        let value = self.leaf(key)?.value.clone();
        let scope = self.readable_scope(key)?;
        let authoritative = self.acts_as_owner(scope);
        let status = self.require(key)?.status;

        if let Some(value) = value {
            if authoritative || status == NodeStatus::Consistent {
                return Ok(PendingGet::ready(value));
            }
        }
        if !authoritative && status == NodeStatus::Inconsistent {
            self.begin_subscribe(key);
        }

        let ticket = GetTicket(self.next_ticket);
        self.next_ticket += 1;
        let (get, slot) = PendingGet::waiting(ticket);
        if let Some(leaf) = self.leaf_mut(key) {
            leaf.pending.retain(|slot| !slot.sender.is_closed());
            leaf.pending.push(slot);
        }
        Ok(get)
    }

    /// Cancel a pending read. Returns `false` if it already resolved.
    pub fn cancel_get(&mut self, key: NodeKey, ticket: GetTicket) -> bool {
        let Some(leaf) = self.leaf_mut(key) else {
            return false;
        };
        let before = leaf.pending.len();
        leaf.pending.retain(|slot| slot.ticket != ticket);
        leaf.pending.len() != before
    }

    /// Write a leaf as the local actor.
    ///
    /// # Errors
    ///
    /// See [`StateTree::set_from`].
    pub fn set(&mut self, key: NodeKey, value: Value) -> Result<SetOutcome, TreeError> {
        let local = self.ctx.local_actor;
        self.set_from(key, value, local)
    }

    /// Write a leaf on behalf of `source`.
    ///
    /// - Owner: runs middleware, applies, fans out to every target but `source`.
    /// - Mirror, local source: applies provisionally and forwards to the owner.
    /// - Mirror, remote source: trusts the owner's value.
    ///
    /// # Errors
    ///
    /// Returns `WrongKind` for non-leaves and `Unauthorized` if `source` may
    /// not write the node. Nothing is mutated on error.
    pub fn set_from(
        &mut self,
        key: NodeKey,
        value: Value,
        source: Actor,
    ) -> Result<SetOutcome, TreeError> {
        self.leaf(key)?;
        let node = self.require(key)?;
        let scope = node.scope();
        if !self.ctx.can_write(&source, scope, node.instance_owner()) {
            return Err(TreeError::Unauthorized {
                actor: source,
                path: self.full_name(key),
                scope,
            });
        }

        if self.acts_as_owner(scope) {
            return Ok(self.set_as_owner(key, value, source, scope));
        }

        if self.ctx.is_local(&source) {
            self.store(key, value.clone());
            if let Some(node) = self.node_mut(key) {
                node.replicator
                    .enqueue(vec![Actor::Server], UnsignedPacket::Update(value));
            }
            self.notify(key);
            tracing::debug!(node = %self.full_name(key), "Forwarded provisional write to owner");
            return Ok(SetOutcome::Forwarded);
        }

        self.store(key, value);
        // An update racing an unsubscribe must not make the leaf look current.
        if self.status(key) != Some(NodeStatus::Inconsistent) {
            self.mark_consistent(key);
        }
        self.notify(key);
        self.resolve_pending(key);
        tracing::debug!(node = %self.full_name(key), source = %source, "Applied owner update");
        Ok(SetOutcome::Applied)
    }

    fn set_as_owner(
        &mut self,
        key: NodeKey,
        value: Value,
        source: Actor,
        scope: ScopeIndex,
    ) -> SetOutcome {
        let path = self.full_name(key);
        let rejection = self.leaf(key).ok().and_then(|leaf| {
            leaf.middleware
                .run(&path, leaf.value.as_ref(), &value)
                .map(|middleware| {
                    middleware.report_failure(&path);
                    (middleware.name().to_string(), middleware.kind(), leaf.value.clone())
                })
        });

        if let Some((middleware, kind, retained)) = rejection {
            // A remote writer already holds the refused value provisionally.
            if !self.ctx.is_local(&source) {
                let old = retained.clone().unwrap_or(Value::Null);
                if let Some(node) = self.node_mut(key) {
                    node.replicator
                        .enqueue(vec![source], UnsignedPacket::Update(old));
                }
            }
            return SetOutcome::Rejected {
                middleware,
                kind,
                retained,
            };
        }

        self.store(key, value.clone());
        if let Some(node) = self.node_mut(key) {
            node.status = NodeStatus::Consistent;
            if scope.replicates() {
                node.replicator.distribute_update(value, &source);
            }
        }
        self.notify(key);
        self.resolve_pending(key);
        tracing::debug!(node = %path, source = %source, "Applied update");
        SetOutcome::Applied
    }

    fn store(&mut self, key: NodeKey, value: Value) {
        if let Some(leaf) = self.leaf_mut(key) {
            leaf.value = Some(value);
        }
    }

    fn resolve_pending(&mut self, key: NodeKey) {
        let Some(leaf) = self.leaf_mut(key) else { return };
        let Some(value) = leaf.value.clone() else { return };
        for slot in leaf.pending.drain(..) {
            // A dropped receiver means the caller lost interest.
            let _ = slot.sender.send(value.clone());
        }
    }

    /// Mark a mirrored leaf consistent and settle subscribing ancestors whose
    /// leaves are now all consistent.
    pub(crate) fn mark_consistent(&mut self, key: NodeKey) {
        let Some(node) = self.node_mut(key) else { return };
        node.status = NodeStatus::Consistent;
        let mut current = node.parent;

        while let Some(k) = current {
            let Some(node) = self.node(k) else { break };
            if node.status != NodeStatus::Subscribing {
                break;
            }
            let parent = node.parent;
            let settled = self.descendants(k).into_iter().all(|d| {
                self.node(d).map_or(true, |n| {
                    !matches!(n.kind, NodeKind::Leaf(_)) || n.status == NodeStatus::Consistent
                })
            });
            if !settled {
                break;
            }
            if let Some(node) = self.node_mut(k) {
                node.status = NodeStatus::Consistent;
            }
            current = parent;
        }
    }

    /// Append a middleware to a leaf, or to every owned leaf under a branch.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` if the local role does not own the node.
    pub fn add_middleware(
        &mut self,
        key: NodeKey,
        middleware: Middleware,
    ) -> Result<(), TreeError> {
        self.for_owned_chains(key, |chain| chain.push(middleware.clone()))
    }

    /// Replace the middleware of a leaf, or of every owned leaf under a branch.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` if the local role does not own the node.
    pub fn set_middleware(
        &mut self,
        key: NodeKey,
        middleware: Vec<Middleware>,
    ) -> Result<(), TreeError> {
        self.for_owned_chains(key, |chain| chain.replace(middleware.clone()))
    }

    fn for_owned_chains<F>(&mut self, key: NodeKey, mut apply: F) -> Result<(), TreeError>
    where
        F: FnMut(&mut MiddlewareChain),
    {
        let scope = self.require(key)?.scope();
        if !self.acts_as_owner(scope) {
            return Err(TreeError::NotOwner {
                path: self.full_name(key),
                scope,
            });
        }
        for k in self.descendants(key) {
            let owned = self.node(k).is_some_and(|n| self.acts_as_owner(n.scope()));
            if !owned {
                continue;
            }
            if let Some(leaf) = self.leaf_mut(k) {
                apply(&mut leaf.middleware);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::GetError;
    use crate::replicator::Wrapped;
    use crate::tree::tests::{client_id, client_tree, server_tree};
    use serde_json::json;

    fn non_negative() -> Middleware {
        Middleware::error("non_negative", |_old: Option<i64>, new: i64| new >= 0)
    }

    #[test]
    fn owner_get_resolves_immediately() {
        let mut tree = server_tree();
        let health = tree.resolve("Public/Health").unwrap();
        let mut get = tree.get(health).unwrap();
        assert!(get.is_immediate());
        assert_eq!(get.try_take(), Some(Ok(json!(100))));
        assert!(tree.drain_outbound().is_empty());
    }

    #[test]
    fn owner_get_on_empty_leaf_waits_for_set() {
        let mut tree = server_tree();
        let motd = tree.resolve("Public/Motd").unwrap();
        let mut get = tree.get(motd).unwrap();
        assert_eq!(get.try_take(), None);
        tree.set(motd, json!("welcome")).unwrap();
        assert_eq!(get.try_take(), Some(Ok(json!("welcome"))));
    }

    #[test]
    fn burst_of_gets_sends_one_subscribe() {
        let mut tree = client_tree(1);
        let health = tree.resolve("Public/Health").unwrap();
        let mut gets: Vec<_> = (0..5).map(|_| tree.get(health).unwrap()).collect();
        assert_eq!(tree.status(health), Some(NodeStatus::Subscribing));

        let out = tree.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].1,
            Wrapped {
                targets: vec![Actor::Server],
                packet: UnsignedPacket::Subscribe
            }
        );

        tree.set_from(health, json!(100), Actor::Server).unwrap();
        assert_eq!(tree.status(health), Some(NodeStatus::Consistent));
        for get in &mut gets {
            assert_eq!(get.try_take(), Some(Ok(json!(100))));
        }
    }

    #[test]
    fn cancelled_get_is_dropped() {
        let mut tree = client_tree(1);
        let health = tree.resolve("Public/Health").unwrap();
        let mut get = tree.get(health).unwrap();
        assert!(tree.cancel_get(health, get.ticket().unwrap()));
        assert_eq!(get.try_take(), Some(Err(GetError::Cancelled)));
        assert!(!tree.cancel_get(health, get.ticket().unwrap()));
    }

    #[test]
    fn abandoned_gets_are_pruned() {
        let mut tree = client_tree(1);
        let health = tree.resolve("Public/Health").unwrap();
        for _ in 0..10 {
            drop(tree.get(health).unwrap());
        }
        let _kept = tree.get(health).unwrap();
        let NodeKind::Leaf(leaf) = tree.node(health).unwrap().kind() else {
            panic!("expected a leaf");
        };
        assert_eq!(leaf.pending_reads(), 1);
    }

    #[test]
    fn owner_set_fans_out_without_echo() {
        let mut tree = server_tree();
        let health = tree.resolve("Public/Health").unwrap();
        let a = Actor::Client(client_id(1));
        let b = Actor::Client(client_id(2));
        tree.subscribe_actor(health, a).unwrap();
        tree.subscribe_actor(health, b).unwrap();
        tree.drain_outbound();

        assert_eq!(tree.set_from(health, json!(250), a), Err(TreeError::Unauthorized {
            actor: a,
            path: "Public/Health".to_string(),
            scope: ScopeIndex::PublicServer,
        }));
        assert_eq!(tree.value(health).unwrap(), Some(&json!(100)));

        assert_eq!(tree.set(health, json!(250)).unwrap(), SetOutcome::Applied);
        let out = tree.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.targets, vec![a, b]);
        assert_eq!(out[0].1.packet, UnsignedPacket::Update(json!(250)));
    }

    #[test]
    fn middleware_rejection_retains_prior_value() {
        let mut tree = server_tree();
        let health = tree.resolve("Public/Health").unwrap();
        tree.add_middleware(health, non_negative()).unwrap();

        let outcome = tree.set(health, json!(-5)).unwrap();
        assert_eq!(
            outcome,
            SetOutcome::Rejected {
                middleware: "non_negative".to_string(),
                kind: MiddlewareKind::Error,
                retained: Some(json!(100)),
            }
        );
        assert!(!outcome.is_applied());
        assert_eq!(tree.value(health).unwrap(), Some(&json!(100)));
        assert!(tree.drain_outbound().is_empty());
    }

    #[test]
    fn hard_rejection_echoes_prior_value_to_remote_writer() {
        let mut server = server_tree();
        let owner = Actor::Client(client_id(1));
        let players = server.resolve("Players").unwrap();
        let (_, instance) = server
            .vine_add(players, serde_json::to_value(owner).unwrap(), Some(owner))
            .unwrap();
        let health = server.resolve("Players/[0]/Health").unwrap();
        assert_eq!(server.node(health).unwrap().parent(), Some(instance));
        server.add_middleware(players, non_negative()).unwrap();
        server.drain_outbound();

        let outcome = server.set_from(health, json!(-5), owner).unwrap();
        assert!(matches!(outcome, SetOutcome::Rejected { .. }));
        let out = server.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.targets, vec![owner]);
        assert_eq!(out[0].1.packet, UnsignedPacket::Update(json!(100)));
    }

    #[test]
    fn warning_rejection_echoes_prior_value() {
        let mut server = server_tree();
        let owner = Actor::Client(client_id(1));
        let players = server.resolve("Players").unwrap();
        server
            .vine_add(players, serde_json::to_value(owner).unwrap(), Some(owner))
            .unwrap();
        let health = server.resolve("Players/[0]/Health").unwrap();
        server
            .set_middleware(
                health,
                vec![Middleware::warning("cap", |_: Option<i64>, v: i64| v <= 100)],
            )
            .unwrap();
        server.drain_outbound();

        let outcome = server.set_from(health, json!(500), owner).unwrap();
        assert!(matches!(outcome, SetOutcome::Rejected { kind: MiddlewareKind::Warning, .. }));
        let out = server.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.targets, vec![owner]);
        assert_eq!(out[0].1.packet, UnsignedPacket::Update(json!(100)));
    }

    #[test]
    fn rejection_on_empty_leaf_echoes_null() {
        let mut server = server_tree();
        let owner = Actor::Client(client_id(1));
        let players = server.resolve("Players").unwrap();
        server
            .vine_add(players, serde_json::to_value(owner).unwrap(), Some(owner))
            .unwrap();
        let name = server.resolve("Players/[0]/Name").unwrap();
        server
            .add_middleware(
                name,
                Middleware::warning("no_tags", |_: Option<Value>, _: Value| false),
            )
            .unwrap();
        server.drain_outbound();

        let outcome = server.set_from(name, json!("x"), owner).unwrap();
        assert_eq!(
            outcome,
            SetOutcome::Rejected {
                middleware: "no_tags".to_string(),
                kind: MiddlewareKind::Warning,
                retained: None,
            }
        );
        assert_eq!(server.value(name).unwrap(), None);
        let out = server.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.targets, vec![owner]);
        assert_eq!(out[0].1.packet, UnsignedPacket::Update(Value::Null));
    }

    #[test]
    fn mirror_local_write_is_forwarded() {
        let me = client_id(1);
        let mut client = client_tree(1);
        let players = client.resolve("Players").unwrap();
        let id = client.id_of(players).unwrap();
        let base = crate::node::NodeId(id.0 + 1);
        client
            .apply_vine_added(
                players,
                crate::node::InstanceId(0),
                serde_json::to_value(Actor::Client(me)).unwrap(),
                base,
                Some(Actor::Client(me)),
            )
            .unwrap();
        let health = client.resolve("Players/[0]/Health").unwrap();

        assert_eq!(client.set(health, json!(90)).unwrap(), SetOutcome::Forwarded);
        assert_eq!(client.value(health).unwrap(), Some(&json!(90)));
        let out = client.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.targets, vec![Actor::Server]);
        assert_eq!(out[0].1.packet, UnsignedPacket::Update(json!(90)));
    }

    #[test]
    fn mirror_cannot_write_server_scope() {
        let mut client = client_tree(1);
        let round = client.resolve("Public/Round").unwrap();
        assert!(matches!(
            client.set(round, json!(9)),
            Err(TreeError::Unauthorized { .. })
        ));
        assert!(client.drain_outbound().is_empty());
    }

    #[test]
    fn private_client_is_local_only() {
        let mut client = client_tree(1);
        let volume = client.resolve("Local/Volume").unwrap();
        assert_eq!(client.set(volume, json!(0.8)).unwrap(), SetOutcome::Applied);
        assert!(client.drain_outbound().is_empty());
        assert!(client.node(volume).unwrap().id().is_none());
    }

    #[test]
    fn middleware_needs_ownership() {
        let mut client = client_tree(1);
        let round = client.resolve("Public/Round").unwrap();
        assert!(matches!(
            client.add_middleware(round, non_negative()),
            Err(TreeError::NotOwner { .. })
        ));
    }

    #[test]
    fn branch_middleware_reaches_every_leaf() {
        let mut tree = server_tree();
        let public = tree.resolve("Public").unwrap();
        tree.add_middleware(
            public,
            Middleware::warning("frozen", |_: Option<Value>, _: Value| false),
        )
        .unwrap();
        let round = tree.resolve("Public/Round").unwrap();
        assert!(matches!(tree.set(round, json!(2)).unwrap(), SetOutcome::Rejected { .. }));
    }

    #[test]
    fn branch_becomes_consistent_once_leaves_are() {
        let mut client = client_tree(1);
        let public = client.resolve("Public").unwrap();
        client.subscribe(public, |_| {}).unwrap();
        assert_eq!(client.status(public), Some(NodeStatus::Subscribing));

        for (path, value) in [("Public/Round", json!(1)), ("Public/Health", json!(100))] {
            let key = client.resolve(path).unwrap();
            client.set_from(key, value, Actor::Server).unwrap();
            assert_eq!(client.status(public), Some(NodeStatus::Subscribing));
        }
        let motd = client.resolve("Public/Motd").unwrap();
        client.set_from(motd, json!("hi"), Actor::Server).unwrap();
        assert_eq!(client.status(public), Some(NodeStatus::Consistent));
    }

    #[test]
    fn get_on_branch_is_wrong_kind() {
        let mut tree = server_tree();
        let public = tree.resolve("Public").unwrap();
        assert!(matches!(
            tree.get(public),
            Err(TreeError::WrongKind { expected: "leaf", actual: "branch", .. })
        ));
    }
}
