//! Delivery-order scenarios in a fixed membership: the three-member ordered subgroup, an
//! unbalanced sender kept moving by null fill, the block transport path, and a raw-mode
//! subgroup.

mod common;

use std::time::Duration;

use log::LevelFilter;

use squall::layout::{ShardPolicy, SubgroupPolicy, SubgroupRegistry};
use squall::types::data_types::{SubgroupId, TypeTag};
use squall::types::view::Mode;

use common::{make_node, mock_network, start_node, wait_until, TestNode};

const NO_FAILURES_SUSPICION: Duration = Duration::from_secs(10);

fn ordered_registry() -> SubgroupRegistry {
    let mut registry = SubgroupRegistry::new();
    registry.register(
        TypeTag::new(1),
        SubgroupPolicy::Automatic {
            shards: vec![ShardPolicy::fixed(3)],
        },
    );
    registry
}

fn start_three() -> Vec<TestNode> {
    let nodes = [make_node(0), make_node(1), make_node(2)];
    let (fabrics, transports, _) = mock_network(&nodes);
    nodes
        .iter()
        .zip(fabrics)
        .zip(transports)
        .map(|((node, fabric), transport)| {
            start_node(
                *node,
                &nodes,
                fabric,
                transport,
                NO_FAILURES_SUSPICION,
                ordered_registry,
            )
        })
        .collect()
}

#[test]
fn three_member_ordered_subgroup_delivers_identically() {
    common::logging::setup_logger(LevelFilter::Warn);
    let cluster = start_three();
    let subgroup = SubgroupId::new(0);

    cluster[0].group.send(subgroup, b"a").unwrap();
    cluster[1].group.send(subgroup, b"b").unwrap();
    cluster[2].group.send(subgroup, b"c").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        cluster
            .iter()
            .all(|node| node.delivered.lock().unwrap().len() == 3)
    }));

    let expected = vec![
        (0u32, 0i64, b"a".to_vec()),
        (0, 1, b"b".to_vec()),
        (0, 2, b"c".to_vec()),
    ];
    for node in &cluster {
        assert_eq!(*node.delivered.lock().unwrap(), expected);
    }
}

#[test]
fn lone_sender_completes_through_null_fill() {
    common::logging::setup_logger(LevelFilter::Warn);
    let cluster = start_three();
    let subgroup = SubgroupId::new(0);

    // Only node 0 sends; the other senders' slots in the rotation are filled with nulls once
    // their null timeout passes, so both messages become deliverable.
    cluster[0].group.send(subgroup, b"m0").unwrap();
    cluster[0].group.send(subgroup, b"m1").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        cluster
            .iter()
            .all(|node| node.delivered.lock().unwrap().len() == 2)
    }));

    // Message (0, 1) has global sequence number 0 + 3·1 = 3; the nulls in between are sequenced
    // but never surface.
    let expected = vec![(0u32, 0i64, b"m0".to_vec()), (0, 3, b"m1".to_vec())];
    for node in &cluster {
        assert_eq!(*node.delivered.lock().unwrap(), expected);
    }
}

#[test]
fn large_payloads_travel_through_the_block_transport() {
    common::logging::setup_logger(LevelFilter::Warn);
    let cluster = start_three();
    let subgroup = SubgroupId::new(0);

    // 100 bytes exceeds the 64-byte inline threshold of the test configuration.
    let big = vec![7u8; 100];
    cluster[0].group.send(subgroup, &big).unwrap();
    cluster[0].group.send(subgroup, b"small").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        cluster
            .iter()
            .all(|node| node.delivered.lock().unwrap().len() == 2)
    }));

    for node in &cluster {
        let delivered = node.delivered.lock().unwrap();
        assert_eq!(delivered[0].2, big);
        assert_eq!(delivered[1].2, b"small".to_vec());
        assert!(delivered[0].1 < delivered[1].1);
    }
}

#[test]
fn randomized_senders_agree_on_one_total_order() {
    common::logging::setup_logger(LevelFilter::Warn);
    use rand::Rng;
    let cluster = start_three();
    let subgroup = SubgroupId::new(0);

    // Each member sends a random number of random payloads; null fill covers the imbalance.
    let mut rng = rand::thread_rng();
    let mut total = 0usize;
    for node in &cluster {
        let count = rng.gen_range(0..6);
        for message in 0..count {
            let payload = [node.node.id.int() as u8, message as u8, rng.gen::<u8>()];
            node.group.send(subgroup, &payload).unwrap();
            total += 1;
        }
    }

    assert!(wait_until(Duration::from_secs(15), || {
        cluster
            .iter()
            .all(|node| node.delivered.lock().unwrap().len() == total)
    }));

    // Identical prefixes of one total order, and per-sender FIFO within it.
    let reference = cluster[0].delivered.lock().unwrap().clone();
    for node in &cluster[1..] {
        assert_eq!(*node.delivered.lock().unwrap(), reference);
    }
    for sender in 0..3u8 {
        let indexes: Vec<u8> = reference
            .iter()
            .filter(|(_, _, payload)| payload[0] == sender)
            .map(|(_, _, payload)| payload[1])
            .collect();
        assert!(indexes.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn raw_subgroup_bypasses_sequencing() {
    common::logging::setup_logger(LevelFilter::Warn);
    let nodes = [make_node(10), make_node(11), make_node(12)];
    let (fabrics, transports, _) = mock_network(&nodes);
    let registry = || {
        let mut registry = SubgroupRegistry::new();
        registry.register(
            TypeTag::new(1),
            SubgroupPolicy::Automatic {
                shards: vec![ShardPolicy::fixed(3)],
            },
        );
        registry.register(
            TypeTag::new(2),
            SubgroupPolicy::Explicit(Box::new(|view| {
                let everyone = view.members.clone();
                let senders = vec![true; everyone.len()];
                Ok(vec![view.make_subview(everyone, Mode::Raw, senders)?])
            })),
        );
        registry
    };
    let cluster: Vec<TestNode> = nodes
        .iter()
        .zip(fabrics)
        .zip(transports)
        .map(|((node, fabric), transport)| {
            start_node(
                *node,
                &nodes,
                fabric,
                transport,
                NO_FAILURES_SUSPICION,
                registry,
            )
        })
        .collect();

    cluster[0].group.send(SubgroupId::new(1), b"raw-payload").unwrap();

    // Raw deliveries carry the "no sequence" sentinel and reach every member, sender included.
    assert!(wait_until(Duration::from_secs(10), || {
        cluster.iter().all(|node| {
            node.delivered
                .lock()
                .unwrap()
                .iter()
                .any(|(subgroup, seq, payload)| {
                    *subgroup == 1 && *seq == -1 && payload == b"raw-payload"
                })
        })
    }));
}
