//! Tree broadcast across simulated clusters

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use trellis_collective::compression::Payload;
use trellis_collective::signature::AckId;
use trellis_collective::wire::{self, AckKind, WireMessage, XcastAckMessage, XcastMessage};
use trellis_collective::{CollectiveConfig, CompressionConfig, XcastSignature};
use trellis_core::{DaemonId, Tag};
use trellis_testkit::{init_tracing, Envelope, SimCluster};

const NEWS: Tag = Tag::user(1);

fn d(rank: u32) -> DaemonId {
    DaemonId(rank)
}

fn assert_quiescent(cluster: &SimCluster, completed: u64) {
    for daemon in cluster.daemons() {
        let progress = cluster.engine(daemon).xcast_progress();
        assert_eq!(progress.op_id_completed, completed, "{daemon}");
        assert!(progress.active.is_empty(), "{daemon} still has {:?}", progress.active);
        assert!(progress.pending.is_empty(), "{daemon} still has {:?}", progress.pending);
    }
}

#[test]
fn broadcast_reaches_every_daemon_once() {
    init_tracing();
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(3), NEWS, b"hello".to_vec()).unwrap();
    cluster.run_until_idle();

    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), vec![b"hello".to_vec()], "{daemon}");
    }
    assert_quiescent(&cluster, 1);
    assert_eq!(cluster.engine(d(3)).stats().xcast.initiated, 1);
}

#[test]
fn single_daemon_broadcasts_to_itself() {
    let mut cluster = SimCluster::new(1, 3);
    cluster.xcast(d(0), NEWS, vec![1]).unwrap();
    cluster.xcast(d(0), NEWS, vec![2]).unwrap();
    cluster.run_until_idle();

    assert_eq!(cluster.deliveries(d(0), NEWS), vec![vec![1], vec![2]]);
    assert_quiescent(&cluster, 2);
}

#[test]
fn concurrent_broadcasts_share_one_order() {
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(6), NEWS, b"a".to_vec()).unwrap();
    cluster.xcast(d(0), NEWS, b"b".to_vec()).unwrap();
    cluster.xcast(d(4), NEWS, b"c".to_vec()).unwrap();
    cluster.xcast(d(2), NEWS, b"d".to_vec()).unwrap();
    cluster.run_until_idle();

    let expected: Vec<Vec<u8>> = ["a", "b", "c", "d"].iter().map(|s| s.as_bytes().to_vec()).collect();
    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), expected, "{daemon}");
    }
    assert_quiescent(&cluster, 4);
}

#[test]
fn large_payloads_arrive_intact() {
    let config = CollectiveConfig {
        compression: CompressionConfig {
            threshold: 64,
            ..CompressionConfig::default()
        },
        ..CollectiveConfig::default()
    };
    let mut cluster = SimCluster::with_config(5, 2, config).unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
    cluster.xcast(d(4), NEWS, payload.clone()).unwrap();
    cluster.run_until_idle();

    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), vec![payload.clone()]);
    }
}

#[test]
fn killing_an_interior_daemon_mid_broadcast_loses_nothing() {
    init_tracing();
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(5), NEWS, b"p".to_vec()).unwrap();
    // Everything except the hop from d1 to its children.
    cluster.run_while(|e| e.to != d(3) && e.to != d(4));
    assert_eq!(cluster.deliveries(d(1), NEWS).len(), 1);
    assert!(cluster.deliveries(d(3), NEWS).is_empty());

    cluster.kill(d(1)).unwrap();
    cluster.run_until_idle();

    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), vec![b"p".to_vec()], "{daemon}");
    }
    assert_quiescent(&cluster, 1);
}

#[test]
fn promoted_daemon_replays_without_redelivering() {
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(0), NEWS, b"q".to_vec()).unwrap();
    // d3 delivers and acks; d4 never hears from d1.
    cluster.run_while(|e| e.to != d(4));
    assert_eq!(cluster.engine(d(3)).xcast_progress().op_id_completed, 1);
    assert_eq!(cluster.engine(d(0)).xcast_progress().active, vec![1]);

    cluster.kill(d(1)).unwrap();
    cluster.run_until_idle();

    assert_eq!(cluster.deliveries(d(3), NEWS), vec![b"q".to_vec()]);
    assert_eq!(cluster.deliveries(d(4), NEWS), vec![b"q".to_vec()]);
    assert_quiescent(&cluster, 1);
}

#[test]
fn unconfirmed_broadcast_is_resent_and_numbered_once() {
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(4), NEWS, b"r".to_vec()).unwrap();
    // Root numbers the op and forwards it; d1 dies before passing it on.
    assert!(cluster.step());
    cluster.kill(d(1)).unwrap();
    cluster.run_until_idle();

    let root = cluster.engine(d(0)).stats();
    assert_eq!(root.xcast.duplicates, 1);
    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), vec![b"r".to_vec()], "{daemon}");
    }
    assert_quiescent(&cluster, 1);
}

#[test]
fn overlapping_broadcasts_survive_a_failure() {
    let mut cluster = SimCluster::new(7, 2);
    cluster.xcast(d(3), NEWS, b"one".to_vec()).unwrap();
    cluster.xcast(d(6), NEWS, b"two".to_vec()).unwrap();
    cluster.xcast(d(0), NEWS, b"three".to_vec()).unwrap();
    for _ in 0..5 {
        assert!(cluster.step());
    }
    cluster.kill(d(2)).unwrap();
    cluster.run_until_idle();

    let expected = vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()];
    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, NEWS), expected, "{daemon}");
    }
    assert_quiescent(&cluster, 3);
}

#[test]
fn routing_updates_reach_their_consumer_everywhere() {
    let mut cluster = SimCluster::new(3, 2);
    cluster.xcast(d(1), Tag::WIREUP, b"routes".to_vec()).unwrap();
    cluster.xcast(d(2), Tag::DAEMON_DIED, b"d9".to_vec()).unwrap();
    cluster.run_until_idle();

    for daemon in cluster.daemons() {
        assert_eq!(cluster.deliveries(daemon, Tag::WIREUP), vec![b"routes".to_vec()]);
        assert_eq!(cluster.deliveries(daemon, Tag::DAEMON_DIED), vec![b"d9".to_vec()]);
    }
}

#[test]
fn garbage_on_the_xcast_tag_forces_exit() {
    let mut cluster = SimCluster::new(3, 2);
    cluster.network().push(Envelope {
        from: d(0),
        to: d(1),
        tag: Tag::XCAST,
        payload: vec![1, 2, 3],
    });
    cluster.run_until_idle();

    assert_eq!(cluster.exits(d(1)).len(), 1);
    assert_eq!(cluster.engine(d(1)).stats().fatal_errors, 1);
    assert!(cluster.exits(d(0)).is_empty());
}

#[test]
fn numbered_op_sent_to_the_root_forces_exit() {
    let mut cluster = SimCluster::new(3, 2);
    let bytes = wire::encode(WireMessage::Xcast(XcastMessage {
        signature: XcastSignature {
            global_id: 9,
            initiator: d(2),
            local_id: 1,
        },
        ack_id: AckId(0),
        tag: NEWS,
        payload: Payload::raw(vec![0]),
    }))
    .unwrap();
    cluster.network().push(Envelope {
        from: d(2),
        to: d(0),
        tag: Tag::XCAST,
        payload: bytes,
    });
    cluster.run_until_idle();

    assert_eq!(cluster.exits(d(0)).len(), 1);
}

#[test]
fn lying_payload_length_forces_exit() {
    let mut cluster = SimCluster::new(3, 2);
    let bytes = wire::encode(WireMessage::Xcast(XcastMessage {
        signature: XcastSignature {
            global_id: 1,
            initiator: d(0),
            local_id: 1,
        },
        ack_id: AckId(0),
        tag: NEWS,
        payload: Payload {
            compressed: true,
            original_len: u64::MAX,
            bytes: vec![1, 2, 3],
        },
    }))
    .unwrap();
    cluster.network().push(Envelope {
        from: d(0),
        to: d(1),
        tag: Tag::XCAST,
        payload: bytes,
    });
    cluster.run_until_idle();

    assert_eq!(cluster.exits(d(1)).len(), 1);
    assert!(cluster.deliveries(d(1), NEWS).is_empty());
    assert!(cluster.exits(d(0)).is_empty());
    assert!(cluster.exits(d(2)).is_empty());
}

#[test]
fn ack_from_a_stranger_is_dropped() {
    let mut cluster = SimCluster::new(7, 2);
    let bytes = wire::encode(WireMessage::XcastAck(XcastAckMessage {
        signature: XcastSignature {
            global_id: 1,
            initiator: d(0),
            local_id: 1,
        },
        ack_id: AckId(0),
        kind: AckKind::Ack,
    }))
    .unwrap();
    cluster.network().push(Envelope {
        from: d(2),
        to: d(3),
        tag: Tag::XCAST_ACK,
        payload: bytes,
    });
    cluster.run_until_idle();

    let stats = cluster.engine(d(3)).stats();
    assert_eq!(stats.xcast.stale_dropped, 1);
    assert_eq!(stats.fatal_errors, 0);
    assert!(cluster.exits(d(3)).is_empty());
}

/// Deliver the oldest message of a pseudo-randomly chosen link, keeping
/// every link FIFO.
fn step_random_link(cluster: &mut SimCluster, state: &mut u64) -> bool {
    let in_flight = cluster.network().in_flight();
    if in_flight.is_empty() {
        return false;
    }
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let pick = &in_flight[(*state >> 33) as usize % in_flight.len()];
    let (from, to) = (pick.from, pick.to);
    cluster.step_where(|e| e.from == from && e.to == to)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_interleaving_delivers_in_global_order(seed in any::<u64>(), initiators in prop::collection::vec(0u32..7, 1..6)) {
        let mut cluster = SimCluster::new(7, 2);
        for (i, initiator) in initiators.iter().enumerate() {
            cluster.xcast(d(*initiator), NEWS, vec![i as u8]).unwrap();
        }
        let mut state = seed;
        let mut steps = 0;
        while step_random_link(&mut cluster, &mut state) {
            steps += 1;
            prop_assert!(steps < 10_000);
        }

        let reference = cluster.deliveries(d(0), NEWS);
        prop_assert_eq!(reference.len(), initiators.len());
        for daemon in cluster.daemons() {
            prop_assert_eq!(&cluster.deliveries(daemon, NEWS), &reference);
            let progress = cluster.engine(daemon).xcast_progress();
            prop_assert_eq!(progress.op_id_completed, initiators.len() as u64);
            prop_assert!(progress.active.is_empty());
        }
    }
}
