//! Network actors and the local replica context.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a fresh random client identity.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant that can send or receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Actor {
    /// The single authoritative server
    Server,
    /// A connected client
    Client(ClientId),
}

impl Actor {
    /// Whether this actor is the server.
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self, Actor::Server)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Server => write!(f, "server"),
            Actor::Client(id) => write!(f, "client:{id}"),
        }
    }
}

/// The role the local process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative server
    Server,
    /// Mirroring client
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Who the local process is, threaded through every authority decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaContext {
    /// The local role
    pub role: Role,
    /// The local actor identity
    pub local_actor: Actor,
}

impl ReplicaContext {
    /// Context for the server process.
    #[must_use]
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            local_actor: Actor::Server,
        }
    }

    /// Context for a client process.
    #[must_use]
    pub fn client(id: ClientId) -> Self {
        Self {
            role: Role::Client,
            local_actor: Actor::Client(id),
        }
    }

    /// Derive the context from a local actor identity.
    #[must_use]
    pub fn for_actor(local_actor: Actor) -> Self {
        match local_actor {
            Actor::Server => Self::server(),
            Actor::Client(id) => Self::client(id),
        }
    }

    /// Whether `actor` is the local process.
    #[must_use]
    pub fn is_local(&self, actor: &Actor) -> bool {
        self.local_actor == *actor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_display() {
        let id = ClientId(Uuid::from_bytes([1; 16]));
        assert_eq!(Actor::Server.to_string(), "server");
        assert_eq!(
            Actor::Client(id).to_string(),
            "client:01010101-0101-0101-0101-010101010101"
        );
    }

    #[test]
    fn context_follows_actor() {
        let id = ClientId::random();
        assert_eq!(ReplicaContext::for_actor(Actor::Server).role, Role::Server);
        let ctx = ReplicaContext::for_actor(Actor::Client(id));
        assert_eq!(ctx.role, Role::Client);
        assert!(ctx.is_local(&Actor::Client(id)));
        assert!(!ctx.is_local(&Actor::Server));
    }
}
