//! An inadequately provisioned membership is refused: the layout fails on every member, the
//! bootstrap is abandoned, and no view is installed.

mod common;

use std::time::Duration;

use log::LevelFilter;

use squall::group::{GroupSpec, StartError};
use squall::layout::{ShardPolicy, SubgroupPolicy, SubgroupRegistry};
use squall::multicast::DeliveryCallback;
use squall::types::data_types::TypeTag;

use common::{make_node, mock_network, test_config};

#[test]
fn underprovisioned_bootstrap_is_refused() {
    common::logging::setup_logger(LevelFilter::Warn);
    let nodes = [make_node(20), make_node(21)];
    let (fabrics, transports, _) = mock_network(&nodes);

    // The policy requires three members per shard; the proposed membership has two.
    for ((node, fabric), transport) in nodes.iter().zip(fabrics).zip(transports) {
        let mut registry = SubgroupRegistry::new();
        registry.register(
            TypeTag::new(1),
            SubgroupPolicy::Automatic {
                shards: vec![ShardPolicy::fixed(3)],
            },
        );
        let delivery: DeliveryCallback = Box::new(|_, _, _| {});
        let spec = GroupSpec::new(
            test_config(*node, Duration::from_secs(10)),
            fabric,
            transport,
            delivery,
        )
        .with_subgroups(registry);

        match spec.start(nodes.to_vec()) {
            Err(StartError::InadequatelyProvisioned) => (),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("an inadequately provisioned view must not be installed"),
        }
    }
}
