//! Runtime configuration.

use anyhow::{bail, Context, Result};
use scopesync_core::{Actor, ClientId, ReplicaContext, Role};
use std::time::Duration;
use uuid::Uuid;

/// Sync runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local role
    pub role: Role,
    /// Identity used when running as a client
    pub client_id: ClientId,
    /// Heartbeat interval
    pub tick: Duration,
    /// Inbound event queue capacity
    pub inbound_capacity: usize,
    /// Heartbeats the loopback demo runs for
    pub demo_ticks: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            client_id: ClientId::random(),
            tick: Duration::from_millis(50),
            inbound_capacity: 1024,
            demo_ticks: 20,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(role) = std::env::var("SCOPESYNC_ROLE") {
            config.role = parse_role(&role)?;
        }

        if let Ok(id) = std::env::var("SCOPESYNC_CLIENT_ID") {
            config.client_id =
                ClientId(Uuid::parse_str(&id).context("Invalid SCOPESYNC_CLIENT_ID")?);
        }

        if let Ok(ms) = std::env::var("SCOPESYNC_TICK_MS") {
            let ms: u64 = ms.parse().context("Invalid SCOPESYNC_TICK_MS")?;
            if ms == 0 {
                bail!("SCOPESYNC_TICK_MS must be positive");
            }
            config.tick = Duration::from_millis(ms);
        }

        if let Ok(capacity) = std::env::var("SCOPESYNC_INBOUND_CAPACITY") {
            config.inbound_capacity = capacity
                .parse()
                .context("Invalid SCOPESYNC_INBOUND_CAPACITY")?;
            if config.inbound_capacity == 0 {
                bail!("SCOPESYNC_INBOUND_CAPACITY must be positive");
            }
        }

        if let Ok(ticks) = std::env::var("SCOPESYNC_DEMO_TICKS") {
            config.demo_ticks = ticks.parse().context("Invalid SCOPESYNC_DEMO_TICKS")?;
        }

        Ok(config)
    }

    /// The local actor implied by the role.
    #[must_use]
    pub fn local_actor(&self) -> Actor {
        match self.role {
            Role::Server => Actor::Server,
            Role::Client => Actor::Client(self.client_id),
        }
    }

    /// Replica context for the configured role.
    #[must_use]
    pub fn context(&self) -> ReplicaContext {
        ReplicaContext::for_actor(self.local_actor())
    }
}

fn parse_role(role: &str) -> Result<Role> {
    match role.to_ascii_lowercase().as_str() {
        "server" => Ok(Role::Server),
        "client" => Ok(Role::Client),
        other => bail!("Invalid SCOPESYNC_ROLE {other:?}, expected server or client"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.tick, Duration::from_millis(50));
        assert_eq!(config.inbound_capacity, 1024);
        assert_eq!(config.local_actor(), Actor::Server);
    }

    #[test]
    fn client_context_uses_client_id() {
        let config = SyncConfig {
            role: Role::Client,
            ..SyncConfig::default()
        };
        let ctx = config.context();
        assert_eq!(ctx.role, Role::Client);
        assert_eq!(ctx.local_actor, Actor::Client(config.client_id));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(parse_role("server").unwrap(), Role::Server);
        assert_eq!(parse_role("Client").unwrap(), Role::Client);
        assert!(parse_role("peer").is_err());
    }
}
