//! End-to-end scenarios across several nodes.
//!
//! Two-node exchanges hand frames across directly; the line topology runs
//! through the simulator's shared air.

use meshgrid_core::mac::{AirtimeConfig, TxOutcome, TxQueue};
use meshgrid_core::node::{MeshEvent, MeshNode, NodeConfig};
use meshgrid_core::session::{self, V1Direct};
use meshgrid_core::simulation::{NodePosition, SimConfig, SimNode, SimRadio, Simulator};
use meshgrid_core::{Clock, DeviceMode, Identity, ManualClock, MemoryStore, Packet, PayloadType, Protocol, RouteType};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn node(seed: u8, name: &str, clock: &ManualClock) -> SimNode {
    let config = NodeConfig {
        name: name.to_string(),
        ..NodeConfig::default()
    };
    MeshNode::new(
        config,
        Identity::from_seed(&[seed; 32]),
        SimRadio::new(),
        clock.clone(),
        StdRng::seed_from_u64(seed as u64),
        MemoryStore::new(),
    )
}

/// Drain `from`'s queue into `to`
fn deliver(from: &mut SimNode, to: &mut SimNode, clock: &ManualClock) -> usize {
    for _ in 0..20 {
        if from.tx_queue().is_empty() {
            break;
        }
        clock.advance(5_000);
        from.tick();
    }
    let frames = from.radio_mut().take_sent();
    for frame in &frames {
        to.process_received_frame(frame, -70, 7.25);
    }
    frames.len()
}

#[test]
fn test_advert_then_v1_message_and_replay() {
    let clock = ManualClock::new(5_000_000);
    let mut a = node(11, "alpha", &clock);
    let mut b = node(22, "bravo", &clock);

    a.send_advertisement(false).expect("advert queued");
    assert_eq!(deliver(&mut a, &mut b, &clock), 1);

    let entry = b.neighbors().find(a.hash()).expect("B learned A");
    assert_eq!(entry.hash, a.identity().public_key()[0]);
    assert!(entry.secret_valid());
    assert_eq!(entry.next_seq_tx, 1);

    b.send_advertisement(false).expect("advert queued");
    deliver(&mut b, &mut a, &clock);

    assert_eq!(a.send_text(b.hash(), "first").expect("send"), Protocol::V1);
    deliver(&mut a, &mut b, &clock);
    let events = b.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        MeshEvent::DirectMessage { text, seq: Some(1), protocol: Protocol::V1, .. } if text == "first"
    )));
    assert_eq!(b.neighbors().find(a.hash()).map(|n| n.last_seq_rx), Some(1));

    // Replay seq 1 under a fresh nonce
    let secret = b
        .neighbors()
        .find(a.hash())
        .and_then(|n| n.secret().cloned())
        .expect("shared secret");
    let replay = V1Direct {
        dest: b.identity().v1_hash(),
        src: a.identity().v1_hash(),
        seq: 1,
        timestamp: clock.unix_time(),
        text: "again".into(),
    };
    let payload = session::encode_v1_direct(&secret, &[0x5A; 12], &replay).expect("encode");
    let frame = Packet::new(RouteType::Direct, PayloadType::TextMessage, payload)
        .with_version(1)
        .to_bytes()
        .expect("frame");
    b.process_received_frame(&frame, -70, 7.25);

    assert!(b.drain_events().is_empty());
    assert_eq!(b.stats().replays, 1);
    assert_eq!(b.stats().auth_failures, 0);
}

#[test]
fn test_tx_queue_priority_order() {
    let mut queue = TxQueue::new(AirtimeConfig::default());
    let mut radio = SimRadio::new();
    queue.enqueue(vec![9; 10], 0, 9, 1_000).expect("slot");
    queue.enqueue(vec![3; 10], 0, 3, 1_000).expect("slot");

    assert!(matches!(queue.process(&mut radio, 1_000), TxOutcome::Sent { .. }));
    assert!(matches!(queue.process(&mut radio, 60_000), TxOutcome::Sent { .. }));
    assert_eq!(radio.take_sent(), vec![vec![3; 10], vec![9; 10]]);
}

#[test]
fn test_repeater_bridges_line_topology() {
    // A and C are out of range of each other; B sits between them
    let positions = vec![
        NodePosition::new(0.0, 0.0),
        NodePosition::new(8_000.0, 0.0),
        NodePosition::new(16_000.0, 0.0),
    ];
    let mut sim = Simulator::with_positions(SimConfig::default().with_seed(7), positions, |i| {
        if i == 1 {
            DeviceMode::Repeater
        } else {
            DeviceMode::Client
        }
    });
    assert!(sim.link(0, 1).is_some());
    assert!(sim.link(1, 2).is_some());
    assert!(sim.link(0, 2).is_none());
    sim.start().expect("start");

    let a_key = *sim.node(0).expect("A").identity().public_key();

    // Retries cover collisions on the air and 1-byte hash clashes
    let mut learned = false;
    for _ in 0..5 {
        sim.node_mut(0).expect("A").send_advertisement(true).expect("advert");
        learned = sim.run_until(600, |s| {
            s.node(2)
                .and_then(|c| c.neighbors().get(&a_key))
                .is_some_and(|n| n.hops == 1)
        });
        if learned {
            break;
        }
    }
    assert!(learned, "C never heard A through B");

    let mut heard = false;
    for _ in 0..5 {
        sim.drain_events();
        sim.node_mut(0).expect("A").send_channel("Public", "hello line").expect("send");
        sim.run(600);
        heard = sim.drain_events().iter().any(|(i, e)| {
            *i == 2 && matches!(e, MeshEvent::ChannelMessage { text, .. } if text.contains("hello line"))
        });
        if heard {
            break;
        }
    }
    assert!(heard, "C never received the channel message");
    assert!(sim.node(1).expect("B").stats().forwarded >= 2);
}
