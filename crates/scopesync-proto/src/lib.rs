//! # ScopeSync Protocol
//!
//! Packet variants, signing, and the multiplexed wire request for ScopeSync.
//!
//! ## Packets
//!
//! - `Handshake`: structural fingerprint, validated before any other traffic
//! - `Update`: a new leaf value
//! - `Subscribe`: a request to be subscribed to a node
//! - `Unsubscribe`: the sender stopped observing a node
//! - `VineAdded` / `VineRemoved`: vine instance lifecycle
//!
//! ## Wire Format
//!
//! One CBOR-encoded `NetworkRequest` per destination per tick, fields omitted
//! when empty: `u`/`v` updates, `s` subscribes, `r` unsubscribes, `h`/`n`
//! handshake, `a`/`x` instance announcements and removals.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod packet;
pub mod request;

pub use batch::batch_by_destination;
pub use packet::{sign_all, Packet, Signed};
pub use request::{MessageError, NetworkRequest, VineAddEntry, VineRemoveEntry};
