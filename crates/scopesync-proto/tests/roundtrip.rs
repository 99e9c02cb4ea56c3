//! Wire round-trip properties.
//!
//! - Every request survives CBOR encoding unchanged, the empty one included
//! - Folding packets into a request and splitting it again yields the same
//!   packets, stably ordered by processing phase

use proptest::prelude::*;
use scopesync_core::{Actor, ClientId, Fingerprint, InstanceId, NodeId};
use scopesync_proto::{NetworkRequest, Packet, VineAddEntry, VineRemoveEntry};
use serde_json::Value;

fn arb_value() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    scalar.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_node() -> impl Strategy<Value = NodeId> {
    (0u32..500).prop_map(NodeId)
}

fn arb_instance() -> impl Strategy<Value = InstanceId> {
    (0u32..50).prop_map(InstanceId)
}

fn arb_actor() -> impl Strategy<Value = Actor> {
    prop_oneof![
        Just(Actor::Server),
        any::<[u8; 16]>().prop_map(|b| Actor::Client(ClientId(uuid::Uuid::from_bytes(b)))),
    ]
}

fn arb_fingerprint() -> impl Strategy<Value = Fingerprint> {
    (any::<u32>(), "[A-Za-z]{0,10}").prop_map(|(node_count, last_root)| Fingerprint {
        node_count,
        last_root,
    })
}

fn arb_request() -> impl Strategy<Value = NetworkRequest> {
    (
        prop::option::of(prop::collection::vec(arb_node(), 0..5)),
        prop::option::of(prop::collection::vec(arb_value(), 0..5)),
        prop::option::of(prop::collection::vec(arb_node(), 0..5)),
        prop::option::of(prop::collection::vec(arb_node(), 0..5)),
        prop::option::of(arb_fingerprint()),
        prop::option::of(prop::collection::vec(
            (
                arb_node(),
                arb_instance(),
                arb_value(),
                arb_node(),
                prop::option::of(arb_actor()),
            ),
            0..3,
        )),
        prop::option::of(prop::collection::vec((arb_node(), arb_instance()), 0..3)),
    )
        .prop_map(|(u, v, s, r, handshake, a, x)| NetworkRequest {
            u,
            v,
            s,
            r,
            h: handshake.as_ref().map(|f| f.node_count),
            n: handshake.map(|f| f.last_root),
            a: a.map(|entries| {
                entries
                    .into_iter()
                    .map(|(node, instance, args, base, owner)| VineAddEntry {
                        node,
                        instance,
                        args,
                        base,
                        owner,
                    })
                    .collect()
            }),
            x: x.map(|entries| {
                entries
                    .into_iter()
                    .map(|(node, instance)| VineRemoveEntry { node, instance })
                    .collect()
            }),
        })
}

fn arb_packet() -> impl Strategy<Value = Packet> {
    let added = (
        arb_node(),
        arb_instance(),
        arb_value(),
        arb_node(),
        prop::option::of(arb_actor()),
    )
        .prop_map(|(node, instance, args, base, owner)| Packet::VineAdded {
            node,
            instance,
            args,
            base,
            owner,
        });
    prop_oneof![
        (arb_node(), arb_value()).prop_map(|(node, value)| Packet::Update { node, value }),
        arb_node().prop_map(|node| Packet::Subscribe { node }),
        arb_node().prop_map(|node| Packet::Unsubscribe { node }),
        added,
        (arb_node(), arb_instance())
            .prop_map(|(node, instance)| Packet::VineRemoved { node, instance }),
    ]
}

fn phase(packet: &Packet) -> u8 {
    match packet {
        Packet::Handshake(_) => 0,
        Packet::VineAdded { .. } => 1,
        Packet::Subscribe { .. } => 2,
        Packet::Unsubscribe { .. } => 3,
        Packet::Update { .. } => 4,
        Packet::VineRemoved { .. } => 5,
    }
}

proptest! {
    #[test]
    fn cbor_roundtrip(request in arb_request()) {
        let bytes = request.to_cbor().unwrap();
        prop_assert_eq!(NetworkRequest::from_cbor(&bytes).unwrap(), request);
    }

    #[test]
    fn packets_roundtrip(
        handshake in prop::option::of(arb_fingerprint()),
        packets in prop::collection::vec(arb_packet(), 0..12),
    ) {
        let mut input: Vec<Packet> = handshake.map(Packet::Handshake).into_iter().collect();
        input.extend(packets);

        let bytes = NetworkRequest::from_packets(input.clone()).to_cbor().unwrap();
        let output = NetworkRequest::from_cbor(&bytes).unwrap().into_packets().unwrap();

        let mut expected = input;
        expected.sort_by_key(phase);
        prop_assert_eq!(output, expected);
    }
}

#[test]
fn empty_request_roundtrip() {
    let request = NetworkRequest::default();
    let bytes = request.to_cbor().unwrap();
    let decoded = NetworkRequest::from_cbor(&bytes).unwrap();
    assert_eq!(decoded, request);
    assert!(decoded.into_packets().unwrap().is_empty());
}
