//! In-process transport.
//!
//! A [`MemoryHub`] routes encoded requests between registered actors over
//! unbounded channels. Used by the loopback binary and the test suites.

use crate::error::TransportError;
use crate::transport::Transport;
use scopesync_core::Actor;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// An encoded request in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sending actor
    pub from: Actor,
    /// Encoded request
    pub payload: Vec<u8>,
}

/// A closed connection, as recorded by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Actor that closed the connection
    pub by: Actor,
    /// Actor that was disconnected
    pub peer: Actor,
    /// Reason given
    pub reason: String,
}

#[derive(Default)]
struct HubState {
    mailboxes: HashMap<Actor, mpsc::UnboundedSender<Delivery>>,
    closed: HashSet<(Actor, Actor)>,
    disconnects: Vec<Disconnect>,
}

/// Shared routing table for in-process actors.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub").finish_non_exhaustive()
    }
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A poisoned hub still holds consistent routing data.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register `actor` and return its mailbox. Re-registering replaces the
    /// previous mailbox, reopens its connections and forgets its recorded
    /// disconnects.
    pub fn register(&self, actor: Actor) -> Mailbox {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.mailboxes.insert(actor, sender);
        state.closed.retain(|(a, b)| *a != actor && *b != actor);
        state.disconnects.retain(|d| d.by != actor && d.peer != actor);
        Mailbox { receiver }
    }

    /// A transport sending as `local`.
    #[must_use]
    pub fn transport(&self, local: Actor) -> MemoryTransport {
        MemoryTransport {
            local,
            hub: self.clone(),
        }
    }

    /// Every disconnect recorded so far.
    #[must_use]
    pub fn disconnects(&self) -> Vec<Disconnect> {
        self.lock().disconnects.clone()
    }

    /// Whether `from` may still reach `to`.
    #[must_use]
    pub fn is_connected(&self, from: &Actor, to: &Actor) -> bool {
        let state = self.lock();
        state.mailboxes.contains_key(to) && !state.closed.contains(&(*from, *to))
    }
}

/// Receiving end for one actor.
#[derive(Debug)]
pub struct Mailbox {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Mailbox {
    /// Take everything delivered so far.
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = self.receiver.try_recv() {
            out.push(delivery);
        }
        out
    }

    /// Wait for the next delivery. `None` once the hub drops the sender.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Sends through a [`MemoryHub`] as one actor.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: Actor,
    hub: MemoryHub,
}

impl Transport for MemoryTransport {
    fn send(&mut self, destination: &Actor, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.hub.lock();
        if state.closed.contains(&(self.local, *destination)) {
            return Err(TransportError::Closed(*destination));
        }
        let mailbox = state
            .mailboxes
            .get(destination)
            .ok_or(TransportError::UnknownDestination(*destination))?;
        mailbox
            .send(Delivery {
                from: self.local,
                payload,
            })
            .map_err(|_| TransportError::Closed(*destination))
    }

    fn disconnect(&mut self, actor: &Actor, reason: &str) {
        let mut state = self.hub.lock();
        state.closed.insert((self.local, *actor));
        state.closed.insert((*actor, self.local));
        state.disconnects.push(Disconnect {
            by: self.local,
            peer: *actor,
            reason: reason.to_string(),
        });
        tracing::info!(by = %self.local, peer = %actor, reason, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_core::ClientId;

    #[test]
    fn routes_between_registered_actors() {
        let hub = MemoryHub::new();
        let client = Actor::Client(ClientId::random());
        let mut server_box = hub.register(Actor::Server);
        let _client_box = hub.register(client);

        let mut transport = hub.transport(client);
        transport.send(&Actor::Server, vec![1, 2, 3]).unwrap();

        assert_eq!(
            server_box.drain(),
            vec![Delivery {
                from: client,
                payload: vec![1, 2, 3]
            }]
        );
        assert!(server_box.drain().is_empty());
    }

    #[test]
    fn unknown_destination_is_an_error() {
        let hub = MemoryHub::new();
        let mut transport = hub.transport(Actor::Server);
        let client = Actor::Client(ClientId::random());
        assert_eq!(
            transport.send(&client, Vec::new()),
            Err(TransportError::UnknownDestination(client))
        );
    }

    #[test]
    fn disconnect_closes_both_directions() {
        let hub = MemoryHub::new();
        let client = Actor::Client(ClientId::random());
        let _server_box = hub.register(Actor::Server);
        let _client_box = hub.register(client);

        let mut server = hub.transport(Actor::Server);
        server.disconnect(&client, "bad handshake");

        assert!(!hub.is_connected(&Actor::Server, &client));
        assert_eq!(
            hub.transport(client).send(&Actor::Server, Vec::new()),
            Err(TransportError::Closed(Actor::Server))
        );
        assert_eq!(hub.disconnects()[0].reason, "bad handshake");
    }

    #[test]
    fn reregistering_reopens_and_forgets() {
        let hub = MemoryHub::new();
        let kept = Actor::Client(ClientId::random());
        let rejoined = Actor::Client(ClientId::random());
        let _server_box = hub.register(Actor::Server);
        let _kept_box = hub.register(kept);
        let _old_box = hub.register(rejoined);

        let mut server = hub.transport(Actor::Server);
        server.disconnect(&kept, "timeout");
        server.disconnect(&rejoined, "bad handshake");
        assert_eq!(hub.disconnects().len(), 2);

        let mut rejoined_box = hub.register(rejoined);
        assert!(hub.is_connected(&Actor::Server, &rejoined));
        assert!(!hub.is_connected(&Actor::Server, &kept));
        let disconnects = hub.disconnects();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].peer, kept);

        server.send(&rejoined, vec![7]).unwrap();
        assert_eq!(rejoined_box.drain().len(), 1);
    }
}
