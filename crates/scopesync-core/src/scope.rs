//! Authority scopes for state subtrees.
//!
//! A scope is declared once on a subtree root and inherited by every descendant
//! down to the next nested declaration.
//!
//! # Authority Rules
//!
//! | Scope | Owner | Writers | Readers | Replicates |
//! |-------|-------|---------|---------|------------|
//! | `PublicServer` | server | server | everyone | yes |
//! | `PrivateServer` | server | server | server | no |
//! | `PrivateClient` | client | local client | local client | no |
//! | `PublicClient` | server | server, instance owner | everyone | yes |
//! | `NeedToKnow` | nobody | server | server | no |
//! | `Unassigned` | nobody | nobody | nobody | no |

use crate::actor::{Actor, ReplicaContext, Role};
use serde::{Deserialize, Serialize};

/// The authority domain of a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScopeIndex {
    /// Server-editable, replicated to every subscribed client
    PublicServer,
    /// Server-editable, visible only to the server
    PrivateServer,
    /// Client-editable, visible only to that client
    PrivateClient,
    /// Server-owned per-client instances, writable by the owning client
    PublicClient,
    /// Server-editable, delivered only on a need-to-know basis
    NeedToKnow,
    /// Not yet assigned
    #[default]
    Unassigned,
}

impl ScopeIndex {
    /// Whether nodes in this scope fan out to subscribers.
    #[must_use]
    pub fn replicates(self) -> bool {
        match self {
            ScopeIndex::PublicServer | ScopeIndex::PublicClient => true,
            ScopeIndex::PrivateServer
            | ScopeIndex::PrivateClient
            | ScopeIndex::NeedToKnow
            | ScopeIndex::Unassigned => false,
        }
    }
}

impl std::fmt::Display for ScopeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScopeIndex::PublicServer => "public-server",
            ScopeIndex::PrivateServer => "private-server",
            ScopeIndex::PrivateClient => "private-client",
            ScopeIndex::PublicClient => "public-client",
            ScopeIndex::NeedToKnow => "need-to-know",
            ScopeIndex::Unassigned => "unassigned",
        };
        write!(f, "{name}")
    }
}

impl ReplicaContext {
    /// Whether the local role is the authoritative owner of `scope`.
    #[must_use]
    pub fn is_owner(&self, scope: ScopeIndex) -> bool {
        match self.role {
            Role::Server => matches!(
                scope,
                ScopeIndex::PrivateServer | ScopeIndex::PublicServer | ScopeIndex::PublicClient
            ),
            Role::Client => scope == ScopeIndex::PrivateClient,
        }
    }

    /// Whether `actor` may write to a node in `scope`.
    ///
    /// `instance_owner` is the owning actor of the enclosing vine instance, if any.
    #[must_use]
    pub fn can_write(
        &self,
        actor: &Actor,
        scope: ScopeIndex,
        instance_owner: Option<&Actor>,
    ) -> bool {
        match scope {
            ScopeIndex::PrivateClient => self.role == Role::Client && self.is_local(actor),
            ScopeIndex::PrivateServer | ScopeIndex::PublicServer | ScopeIndex::NeedToKnow => {
                actor.is_server()
            }
            ScopeIndex::PublicClient => actor.is_server() || instance_owner == Some(actor),
            ScopeIndex::Unassigned => false,
        }
    }

    /// Whether the local role may observe a node in `scope`.
    #[must_use]
    pub fn can_read(&self, scope: ScopeIndex) -> bool {
        match scope {
            ScopeIndex::PublicServer | ScopeIndex::PublicClient => true,
            ScopeIndex::PrivateServer | ScopeIndex::NeedToKnow => self.role == Role::Server,
            ScopeIndex::PrivateClient => self.role == Role::Client,
            ScopeIndex::Unassigned => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ClientId;

    const ALL: [ScopeIndex; 6] = [
        ScopeIndex::PublicServer,
        ScopeIndex::PrivateServer,
        ScopeIndex::PrivateClient,
        ScopeIndex::PublicClient,
        ScopeIndex::NeedToKnow,
        ScopeIndex::Unassigned,
    ];

    #[test]
    fn only_public_scopes_replicate() {
        let replicating: Vec<_> = ALL.into_iter().filter(|s| s.replicates()).collect();
        assert_eq!(
            replicating,
            vec![ScopeIndex::PublicServer, ScopeIndex::PublicClient]
        );
    }

    #[test]
    fn ownership_by_role() {
        let server = ReplicaContext::server();
        let client = ReplicaContext::client(ClientId::random());

        let server_owned: Vec<_> = ALL.into_iter().filter(|s| server.is_owner(*s)).collect();
        assert_eq!(
            server_owned,
            vec![
                ScopeIndex::PublicServer,
                ScopeIndex::PrivateServer,
                ScopeIndex::PublicClient
            ]
        );

        let client_owned: Vec<_> = ALL.into_iter().filter(|s| client.is_owner(*s)).collect();
        assert_eq!(client_owned, vec![ScopeIndex::PrivateClient]);
    }

    #[test]
    fn private_client_writable_only_by_local_client() {
        let me = ClientId::random();
        let other = ClientId::random();
        let client = ReplicaContext::client(me);
        let server = ReplicaContext::server();

        assert!(client.can_write(&Actor::Client(me), ScopeIndex::PrivateClient, None));
        assert!(!client.can_write(&Actor::Client(other), ScopeIndex::PrivateClient, None));
        assert!(!client.can_write(&Actor::Server, ScopeIndex::PrivateClient, None));
        assert!(!server.can_write(&Actor::Client(me), ScopeIndex::PrivateClient, None));
    }

    #[test]
    fn server_scopes_writable_only_by_server() {
        let client = ClientId::random();
        let ctx = ReplicaContext::server();
        for scope in [
            ScopeIndex::PublicServer,
            ScopeIndex::PrivateServer,
            ScopeIndex::NeedToKnow,
        ] {
            assert!(ctx.can_write(&Actor::Server, scope, None));
            assert!(!ctx.can_write(&Actor::Client(client), scope, None));
        }
    }

    #[test]
    fn public_client_writable_by_instance_owner() {
        let owner = Actor::Client(ClientId::random());
        let stranger = Actor::Client(ClientId::random());
        let ctx = ReplicaContext::server();

        assert!(ctx.can_write(&Actor::Server, ScopeIndex::PublicClient, Some(&owner)));
        assert!(ctx.can_write(&owner, ScopeIndex::PublicClient, Some(&owner)));
        assert!(!ctx.can_write(&stranger, ScopeIndex::PublicClient, Some(&owner)));
        assert!(!ctx.can_write(&owner, ScopeIndex::PublicClient, None));
    }

    #[test]
    fn unassigned_is_inert() {
        let ctx = ReplicaContext::server();
        assert!(!ctx.is_owner(ScopeIndex::Unassigned));
        assert!(!ctx.can_read(ScopeIndex::Unassigned));
        assert!(!ctx.can_write(&Actor::Server, ScopeIndex::Unassigned, None));
    }
}
