//! Network coordinator.
//!
//! Owns one [`StateTree`] and moves its packets across a [`Transport`]:
//! per tick it drains every replicator, signs and batches the packets into one
//! request per destination, and sends them. Inbound requests are decoded and
//! routed back to nodes by id. Anything a well-behaved peer would never send
//! closes that peer's connection.

use crate::error::{NetError, ProtocolViolation};
use crate::transport::{ActorDirectory, Transport};
use scopesync_core::{
    Actor, Definition, NodeId, ReplicaContext, Role, SetOutcome, StateTree, TreeError,
};
use scopesync_proto::{batch_by_destination, sign_all, NetworkRequest, Packet, Signed};
use std::collections::{BTreeSet, HashSet};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Ids assigned, nothing sent yet
    Built,
    /// At least one tick has run
    Running,
}

/// What one tick put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Signed packets drained this tick
    pub packets: usize,
    /// Requests handed to the transport
    pub requests: usize,
    /// Requests that could not be encoded or sent
    pub failures: usize,
}

/// Drives replication for one process.
pub struct Coordinator {
    tree: StateTree,
    phase: Phase,
    preamble: Vec<Signed>,
    handshaken: HashSet<Actor>,
    connected: BTreeSet<Actor>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("role", &self.tree.context().role)
            .field("phase", &self.phase)
            .field("fingerprint", self.tree.fingerprint())
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build the tree and assign node ids. A client queues its handshake so
    /// that it leads the first request to the server.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Tree` if the definitions are invalid.
    pub fn build<K, I>(roots: I, ctx: ReplicaContext) -> Result<Self, NetError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        let tree = StateTree::build(roots, ctx)?;
        let preamble = match ctx.role {
            Role::Server => Vec::new(),
            Role::Client => vec![Signed::handshake(tree.fingerprint().clone())],
        };
        tracing::info!(
            role = %ctx.role,
            actor = %ctx.local_actor,
            fingerprint = %tree.fingerprint(),
            "Coordinator built"
        );
        Ok(Self {
            tree,
            phase: Phase::Built,
            preamble,
            handshaken: HashSet::new(),
            connected: BTreeSet::new(),
        })
    }

    /// Build for the directory's local actor and attach to it.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::build`] and [`Coordinator::attach`].
    pub fn from_directory<K, I>(roots: I, directory: &dyn ActorDirectory) -> Result<Self, NetError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Definition)>,
    {
        let mut coordinator =
            Self::build(roots, ReplicaContext::for_actor(directory.local_actor()))?;
        coordinator.attach(directory)?;
        Ok(coordinator)
    }

    /// Treat every actor the directory already lists as newly connected.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Tree` if a per-actor instance cannot be created.
    pub fn attach(&mut self, directory: &dyn ActorDirectory) -> Result<(), NetError> {
        let local = self.tree.context().local_actor;
        for actor in directory.actors() {
            if actor != local {
                self.actor_connected(actor)?;
            }
        }
        Ok(())
    }

    /// The replicated tree.
    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Mutable access for local reads, writes and subscriptions.
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether `actor` has completed a matching handshake.
    #[must_use]
    pub fn is_handshaken(&self, actor: &Actor) -> bool {
        self.handshaken.contains(actor)
    }

    /// Actors currently known as connected.
    pub fn connected(&self) -> impl Iterator<Item = &Actor> {
        self.connected.iter()
    }

    fn role(&self) -> Role {
        self.tree.context().role
    }

    /// Drain every replicator and send one request per destination.
    pub fn tick(&mut self, transport: &mut dyn Transport) -> TickReport {
        if self.phase == Phase::Built {
            self.phase = Phase::Running;
            tracing::info!(role = %self.role(), "Coordinator running");
        }

        let mut signed = std::mem::take(&mut self.preamble);
        signed.extend(sign_all(self.tree.drain_outbound()));

        let mut report = TickReport {
            packets: signed.len(),
            ..TickReport::default()
        };
        if signed.is_empty() {
            return report;
        }

        for (destination, request) in batch_by_destination(signed) {
            let payload = match request.to_cbor() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(%destination, error = %e, "Failed to encode request");
                    report.failures += 1;
                    continue;
                }
            };
            let size = payload.len();
            match transport.send(&destination, payload) {
                Ok(()) => {
                    tracing::debug!(%destination, bytes = size, "Sent request");
                    report.requests += 1;
                }
                Err(e) => {
                    tracing::warn!(%destination, error = %e, "Failed to send request");
                    report.failures += 1;
                }
            }
        }
        report
    }

    /// Decode and apply a request from `source`.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Protocol` after disconnecting `source` if the request
    /// violates the protocol. Packets before the violation stay applied.
    pub fn process_request(
        &mut self,
        payload: &[u8],
        source: Actor,
        transport: &mut dyn Transport,
    ) -> Result<(), NetError> {
        match self.handle_request(payload, source) {
            Ok(()) => Ok(()),
            Err(violation) => {
                tracing::error!(%source, %violation, "Protocol violation, closing connection");
                transport.disconnect(&source, &violation.to_string());
                if let Err(e) = self.actor_disconnected(source) {
                    tracing::warn!(%source, error = %e, "Failed to clean up after violation");
                }
                Err(NetError::Protocol {
                    actor: source,
                    violation,
                })
            }
        }
    }

    fn handle_request(&mut self, payload: &[u8], source: Actor) -> Result<(), ProtocolViolation> {
        if self.role() == Role::Client && !source.is_server() {
            return Err(ProtocolViolation::UntrustedSource(source));
        }
        let packets = NetworkRequest::from_cbor(payload)
            .and_then(NetworkRequest::into_packets)
            .map_err(ProtocolViolation::Malformed)?;
        tracing::debug!(%source, packets = packets.len(), "Received request");
        for packet in packets {
            match self.role() {
                Role::Server => self.handle_as_server(packet, source)?,
                Role::Client => self.handle_as_client(packet)?,
            }
        }
        Ok(())
    }

    fn handle_as_server(&mut self, packet: Packet, source: Actor) -> Result<(), ProtocolViolation> {
        if let Packet::Handshake(remote) = &packet {
            let local = self.tree.fingerprint();
            if remote != local {
                return Err(ProtocolViolation::HandshakeMismatch {
                    local: local.clone(),
                    remote: remote.clone(),
                });
            }
            self.handshaken.insert(source);
            tracing::info!(%source, fingerprint = %remote, "Handshake accepted");
            return Ok(());
        }
        if !self.handshaken.contains(&source) {
            return Err(ProtocolViolation::NotHandshaken { kind: packet.kind() });
        }

        match packet {
            Packet::Update { node, value } => {
                let outcome = self
                    .tree
                    .apply_update(node, value, source)
                    .map_err(|e| ProtocolViolation::from_tree(node, e))?;
                log_outcome(node, source, &outcome);
                Ok(())
            }
            Packet::Subscribe { node } => self
                .tree
                .apply_subscribe(node, source)
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
            Packet::Unsubscribe { node } => self
                .tree
                .apply_unsubscribe(node, source)
                .map(|_| ())
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
            other => Err(ProtocolViolation::UnexpectedPacket {
                kind: other.kind(),
                role: "server",
            }),
        }
    }

    fn handle_as_client(&mut self, packet: Packet) -> Result<(), ProtocolViolation> {
        match packet {
            Packet::Handshake(_) => Err(ProtocolViolation::UnexpectedHandshake),
            Packet::Update { node, value } => {
                let outcome = self
                    .tree
                    .apply_update(node, value, Actor::Server)
                    .map_err(|e| ProtocolViolation::from_tree(node, e))?;
                log_outcome(node, Actor::Server, &outcome);
                Ok(())
            }
            Packet::Subscribe { node } => self
                .tree
                .apply_subscribe(node, Actor::Server)
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
            Packet::Unsubscribe { node } => self
                .tree
                .apply_unsubscribe(node, Actor::Server)
                .map(|_| ())
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
            Packet::VineAdded {
                node,
                instance,
                args,
                base,
                owner,
            } => self
                .tree
                .apply_vine_added_by_id(node, instance, args, base, owner)
                .map(|_| ())
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
            Packet::VineRemoved { node, instance } => self
                .tree
                .apply_vine_removed_by_id(node, instance)
                .map(|_| ())
                .map_err(|e| ProtocolViolation::from_tree(node, e)),
        }
    }

    /// Register a newly connected actor. On the server every per-actor vine
    /// gets an instance owned by it.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Tree` if an instance cannot be created.
    pub fn actor_connected(&mut self, actor: Actor) -> Result<(), NetError> {
        if !self.connected.insert(actor) {
            return Ok(());
        }
        tracing::info!(%actor, "Actor connected");
        if actor.is_server() {
            return Ok(());
        }

        let args = serde_json::to_value(actor).map_err(|e| TreeError::Value(e.to_string()))?;
        for vine in self.tree.per_actor_vines() {
            if self.tree.instance_owned_by(vine, &actor).is_none() {
                self.tree.vine_add(vine, args.clone(), Some(actor))?;
            }
        }
        Ok(())
    }

    /// Forget a departed actor: its handshake, subscriptions and per-actor
    /// instances.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Tree` if an instance cannot be removed.
    pub fn actor_disconnected(&mut self, actor: Actor) -> Result<(), NetError> {
        let was_connected = self.connected.remove(&actor);
        self.handshaken.remove(&actor);
        let removed = self.tree.remove_actor(&actor);

        for vine in self.tree.per_actor_vines() {
            if let Some(instance) = self.tree.instance_owned_by(vine, &actor) {
                self.tree.vine_remove(vine, instance)?;
            }
        }
        if was_connected || removed > 0 {
            tracing::info!(%actor, subscriptions = removed, "Actor disconnected");
        }
        Ok(())
    }
}

fn log_outcome(node: NodeId, source: Actor, outcome: &SetOutcome) {
    match outcome {
        SetOutcome::Applied | SetOutcome::Forwarded => {
            tracing::debug!(%node, %source, "Applied update");
        }
        SetOutcome::Rejected { middleware, .. } => {
            tracing::debug!(%node, %source, %middleware, "Update rejected by middleware");
        }
    }
}
