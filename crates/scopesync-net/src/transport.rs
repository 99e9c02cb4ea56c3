//! Transport and actor directory seams.
//!
//! Inbound delivery and join/leave notifications reach the coordinator through
//! [`crate::runtime::RuntimeEvent`]; these traits only cover the outbound side.

use crate::error::TransportError;
use scopesync_core::Actor;

/// Reliable, ordered, per-destination message delivery.
pub trait Transport {
    /// Send one encoded request to `destination`.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if the destination cannot be reached.
    fn send(&mut self, destination: &Actor, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection to `actor`.
    fn disconnect(&mut self, actor: &Actor, reason: &str);
}

/// The set of connected actors as seen by the local process.
pub trait ActorDirectory {
    /// Currently connected remote actors.
    fn actors(&self) -> Vec<Actor>;

    /// The local actor identity.
    fn local_actor(&self) -> Actor;
}

/// A fixed directory.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    local: Actor,
    actors: Vec<Actor>,
}

impl StaticDirectory {
    /// Create a directory for `local` with the given connected actors.
    #[must_use]
    pub fn new(local: Actor, actors: Vec<Actor>) -> Self {
        Self { local, actors }
    }
}

impl ActorDirectory for StaticDirectory {
    fn actors(&self) -> Vec<Actor> {
        self.actors.clone()
    }

    fn local_actor(&self) -> Actor {
        self.local
    }
}
