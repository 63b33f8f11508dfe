//! A node joins a running group: the join commits as a view change, the joiner receives the
//! replicated state out of band, and it never observes pre-join multicasts.

mod common;

use std::time::Duration;

use log::LevelFilter;

use squall::layout::{ShardPolicy, SubgroupPolicy, SubgroupRegistry};
use squall::types::data_types::{SubgroupId, TypeTag};
use squall::types::view::Mode;

use common::{join_node, make_node, mock_network, send_retry, start_node, wait_until, TestNode};

const NO_FAILURES_SUSPICION: Duration = Duration::from_secs(10);

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
fn joiner_sees_no_gap() {
    common::logging::setup_logger(LevelFilter::Warn);
    let node0 = make_node(0);
    let node1 = make_node(1);
    let node2 = make_node(2);
    let all = [node0, node1, node2];
    let initial = [node0, node1];
    // Plan ahead: the mock network must know every node that will ever join.
    let (mut fabrics, mut transports, _net) = mock_network(&all);
    let fabric2 = fabrics.pop().unwrap();
    let transport2 = transports.pop().unwrap();

    let survivors: Vec<TestNode> = initial
        .iter()
        .zip(fabrics)
        .zip(transports)
        .map(|((node, fabric), transport)| {
            start_node(
                *node,
                &initial,
                fabric,
                transport,
                NO_FAILURES_SUSPICION,
                registry,
            )
        })
        .collect();
    let subgroup = SubgroupId::new(0);

    // Two multicasts before the join, fully delivered at both members.
    survivors[0].group.send(subgroup, b"m0").unwrap();
    survivors[0].group.send(subgroup, b"m1").unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        survivors
            .iter()
            .all(|node| node.delivered.lock().unwrap().len() == 2)
    }));

    // The join blocks until the leader commits the change and transfers state.
    let joiner = join_node(
        node2,
        node0.address.gms_addr(),
        fabric2,
        transport2,
        NO_FAILURES_SUSPICION,
        registry,
    );

    assert!(wait_until(Duration::from_secs(10), || {
        survivors.iter().all(|node| {
            let view = node.group.current_view();
            view.vid.int() == 1 && view.num_members() == 3
        })
    }));
    assert_eq!(joiner.group.current_view().vid.int(), 1);

    // The joiner never observes the pre-join messages; their effect arrives as transferred
    // state instead.
    assert!(joiner.delivered.lock().unwrap().is_empty());
    assert_eq!(joiner.state.lock().unwrap().0, b"m0m1".to_vec());

    // Delivery for the joiner begins at the new view's global sequence number 0.
    send_retry(&survivors[0], subgroup, b"m2", Duration::from_secs(10));
    assert!(wait_until(Duration::from_secs(10), || {
        joiner.delivered.lock().unwrap().len() == 1
    }));
    assert_eq!(
        *joiner.delivered.lock().unwrap(),
        vec![(0u32, 0i64, b"m2".to_vec())]
    );
    assert!(wait_until(Duration::from_secs(10), || {
        survivors.iter().all(|node| {
            node.delivered
                .lock()
                .unwrap()
                .iter()
                .any(|(_, _, payload)| payload == b"m2")
        })
    }));

    // Survivors crossed the view transition having delivered identical sequences.
    assert_eq!(
        *survivors[0].delivered.lock().unwrap(),
        *survivors[1].delivered.lock().unwrap()
    );
}
