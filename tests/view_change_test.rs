//! Failure-driven view change: a crashed member is suspected, the survivors agree on the
//! ragged-edge cutoff, deliver the same multiset, install the shrunken view, and pending
//! point-to-point results addressed to the departed complete with `NodeRemoved`.

mod common;

use std::time::Duration;

use log::LevelFilter;

use squall::layout::{ShardPolicy, SubgroupPolicy, SubgroupRegistry};
use squall::p2p::P2pError;
use squall::types::data_types::{SubgroupId, TypeTag};
use squall::types::view::Mode;

use common::{make_node, mock_network, send_retry, start_node, wait_until, TestNode};

const SUSPICION: Duration = Duration::from_millis(800);

fn registry() -> SubgroupRegistry {
    let mut registry = SubgroupRegistry::new();
    registry.register(
        TypeTag::new(1),
        SubgroupPolicy::Automatic {
            shards: vec![ShardPolicy::flexible(1, 4, Mode::Ordered)],
        },
    );
    registry
}

#[test]
fn crash_completes_cleanup_among_survivors() {
    common::logging::setup_logger(LevelFilter::Warn);
    let nodes = [make_node(0), make_node(1), make_node(2), make_node(3)];
    let (fabrics, transports, net) = mock_network(&nodes);
    let mut cluster: Vec<TestNode> = nodes
        .iter()
        .zip(fabrics)
        .zip(transports)
        .map(|((node, fabric), transport)| {
            start_node(*node, &nodes, fabric, transport, SUSPICION, registry)
        })
        .collect();
    let subgroup = SubgroupId::new(0);

    // Every member sends exactly two messages. Once a send returns, its updates are queued at
    // every peer, so the ragged-edge minimum will be 2 for every sender slot.
    for round in 0..2u8 {
        for node in &cluster {
            let payload = [node.node.id.int() as u8, round];
            node.group.send(subgroup, &payload).unwrap();
        }
    }

    // An outstanding p2p query addressed to the node about to crash.
    let (_, promise) = cluster[1].group.pending_p2p().register(nodes[0].id);

    // Crash node 0: silence its threads, then fail its fabric endpoints.
    let node0 = cluster.remove(0);
    drop(node0.group);
    net.kill(nodes[0].id);

    // The survivors suspect node 0, run the change through commit, wedge, and cleanup, and
    // install the three-member view.
    assert!(wait_until(Duration::from_secs(20), || {
        cluster.iter().all(|node| {
            let view = node.group.current_view();
            view.vid.int() == 1 && view.num_members() == 3
        })
    }));

    // Ragged-edge agreement: every survivor delivered exactly two messages per sender
    // (including two from the crashed node 0), in the same total order.
    for node in &cluster {
        let delivered = node.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 8);
        for sender in 0..4u8 {
            let from_sender = delivered
                .iter()
                .filter(|(_, _, payload)| payload[0] == sender)
                .count();
            assert_eq!(from_sender, 2, "wrong count from sender {}", sender);
        }
    }
    assert_eq!(
        *cluster[0].delivered.lock().unwrap(),
        *cluster[1].delivered.lock().unwrap()
    );
    assert_eq!(
        *cluster[1].delivered.lock().unwrap(),
        *cluster[2].delivered.lock().unwrap()
    );

    // The pending result completed with NodeRemoved, with no other reply.
    assert_eq!(
        promise.wait_reply(Duration::from_secs(5)),
        Some(Err(P2pError::NodeRemoved))
    );

    // The new view multicasts normally.
    send_retry(&cluster[0], subgroup, b"post-change", Duration::from_secs(10));
    assert!(wait_until(Duration::from_secs(10), || {
        cluster.iter().all(|node| {
            node.delivered
                .lock()
                .unwrap()
                .iter()
                .any(|(_, _, payload)| payload == b"post-change")
        })
    }));
}
