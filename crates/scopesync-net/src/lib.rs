//! # ScopeSync Network
//!
//! Moves a ScopeSync tree across the wire.
//!
//! ## Overview
//!
//! - [`Coordinator`]: per-tick drain, sign, batch and send; inbound dispatch
//!   and protocol-violation handling
//! - [`Runtime`]: a single tokio task driving a coordinator from a heartbeat
//!   and an inbound event queue
//! - [`Transport`] / [`ActorDirectory`]: the seams to a real network
//! - [`MemoryHub`]: an in-process transport for tests and the loopback demo
//!
//! ## Connection Lifecycle
//!
//! A client's first request leads with its handshake. The server refuses every
//! other packet until the fingerprint matches, and closes the connection if it
//! does not. On join, the server creates the actor's per-actor instances; on
//! leave, it drops them along with every subscription the actor held.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod transport;

pub use config::SyncConfig;
pub use coordinator::{Coordinator, Phase, TickReport};
pub use error::{NetError, ProtocolViolation, TransportError};
pub use memory::{Delivery, Disconnect, Mailbox, MemoryHub, MemoryTransport};
pub use runtime::{ApplyFn, Runtime, RuntimeEvent, RuntimeHandle};
pub use transport::{ActorDirectory, StaticDirectory, Transport};
