//! Per-destination batching.

use crate::packet::{Packet, Signed};
use crate::request::NetworkRequest;
use scopesync_core::Actor;
use std::collections::BTreeMap;

/// Group signed packets into one request per destination actor.
///
/// Each destination sees its packets in the order they were signed.
#[must_use]
pub fn batch_by_destination(signed: Vec<Signed>) -> BTreeMap<Actor, NetworkRequest> {
    let mut grouped: BTreeMap<Actor, Vec<Packet>> = BTreeMap::new();
    for Signed { targets, packet } in signed {
        for target in targets {
            grouped.entry(target).or_default().push(packet.clone());
        }
    }
    grouped
        .into_iter()
        .map(|(actor, packets)| (actor, NetworkRequest::from_packets(packets)))
        .collect()
}
