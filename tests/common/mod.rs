//! A "mock" (totally local) cluster for driving squall members in-process: a channel-backed
//! fabric and block transport, plus a node harness that records deliveries, views, and
//! replicated state.

pub(crate) mod logging;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use squall::config::{
    Configuration, IdentityConfig, MembershipConfig, MulticastConfig, SstConfig,
};
use squall::group::{Group, GroupSpec};
use squall::layout::SubgroupRegistry;
use squall::membership::{ReplicatedState, StateRegistry};
use squall::multicast::transport::{BlockMessage, BlockTransport, TransportError};
use squall::multicast::UpcallContext;
use squall::sst::fabric::{Fabric, FabricError, RowUpdate};
use squall::types::data_types::{NodeId, PayloadSize, SequenceNumber, SubgroupId, TypeTag, WindowSize};
use squall::types::node::{Node, NodeAddress};
use squall::types::view::View;

/// Shared state of the whole mock cluster: per-node word-update and block inboxes, the view
/// each node is currently bound to, and the set of "crashed" nodes.
///
/// ## View-aware buffering
///
/// Updates addressed to a view the receiver has not installed yet are buffered and replayed once
/// `install_view` advances the receiver; updates for superseded views are discarded. Without
/// this, a node that installs a view slightly later than its peers would drain (and drop) its
/// successor-view traffic through the old view's poller.
///
/// ## Limitations
///
/// `install_view` does not change the set of reachable peers: every node that might ever join
/// must be wired in by [`mock_network`] up front. Tests that grow the membership "plan ahead"
/// and create the network with extra nodes.
pub(crate) struct ClusterNet {
    row_inboxes: Mutex<HashMap<NodeId, VecDeque<RowUpdate>>>,
    row_future: Mutex<HashMap<NodeId, Vec<RowUpdate>>>,
    block_inboxes: Mutex<HashMap<NodeId, VecDeque<(i32, BlockMessage)>>>,
    block_future: Mutex<HashMap<NodeId, Vec<(i32, BlockMessage)>>>,
    current_vid: Mutex<HashMap<NodeId, i32>>,
    down: Mutex<HashSet<NodeId>>,
}

impl ClusterNet {
    /// Simulate a crash: the node's writes fail, writes to it fail, and it receives nothing.
    pub(crate) fn kill(&self, node: NodeId) {
        self.down.lock().unwrap().insert(node);
    }

    fn is_down(&self, node: NodeId) -> bool {
        self.down.lock().unwrap().contains(&node)
    }

    fn vid_of(&self, node: NodeId) -> i32 {
        *self.current_vid.lock().unwrap().get(&node).unwrap_or(&0)
    }
}

#[derive(Clone)]
pub(crate) struct TestFabric {
    my_id: NodeId,
    net: Arc<ClusterNet>,
}

impl Fabric for TestFabric {
    fn install_view(&mut self, view: &View) {
        self.net
            .current_vid
            .lock()
            .unwrap()
            .insert(self.my_id, view.vid.int());
    }

    fn write(
        &mut self,
        peer: NodeId,
        vid: squall::types::data_types::ViewId,
        offset: usize,
        words: &[i64],
    ) -> Result<(), FabricError> {
        if self.net.is_down(self.my_id) || self.net.is_down(peer) {
            return Err(FabricError::Unreachable);
        }
        let mut inboxes = self.net.row_inboxes.lock().unwrap();
        let inbox = inboxes.get_mut(&peer).ok_or(FabricError::Unreachable)?;
        inbox.push_back(RowUpdate {
            origin: self.my_id,
            vid,
            offset,
            words: words.to_vec(),
        });
        Ok(())
    }

    fn recv(&mut self) -> Option<RowUpdate> {
        if self.net.is_down(self.my_id) {
            return None;
        }
        let cur = self.net.vid_of(self.my_id);

        // Replay a buffered update whose view has since been installed.
        {
            let mut future = self.net.row_future.lock().unwrap();
            if let Some(buffered) = future.get_mut(&self.my_id) {
                if let Some(position) = buffered.iter().position(|u| u.vid.int() == cur) {
                    return Some(buffered.remove(position));
                }
            }
        }

        loop {
            let update = self
                .net
                .row_inboxes
                .lock()
                .unwrap()
                .get_mut(&self.my_id)?
                .pop_front()?;
            if update.vid.int() < cur {
                continue;
            }
            if update.vid.int() == cur {
                return Some(update);
            }
            self.net
                .row_future
                .lock()
                .unwrap()
                .entry(self.my_id)
                .or_default()
                .push(update);
        }
    }
}

#[derive(Clone)]
pub(crate) struct TestBlockTransport {
    my_id: NodeId,
    net: Arc<ClusterNet>,
}

impl BlockTransport for TestBlockTransport {
    fn install_view(&mut self, view: &View) {
        self.net
            .current_vid
            .lock()
            .unwrap()
            .insert(self.my_id, view.vid.int());
    }

    fn send(
        &mut self,
        subgroup: SubgroupId,
        receivers: &[NodeId],
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.net.is_down(self.my_id) {
            return Err(TransportError::Unreachable(self.my_id));
        }
        let vid = self.net.vid_of(self.my_id);
        let mut first_unreachable = None;
        for receiver in receivers {
            if self.net.is_down(*receiver) {
                first_unreachable.get_or_insert(*receiver);
                continue;
            }
            self.net
                .block_inboxes
                .lock()
                .unwrap()
                .entry(*receiver)
                .or_default()
                .push_back((
                    vid,
                    BlockMessage {
                        subgroup,
                        sender: self.my_id,
                        payload: payload.to_vec(),
                    },
                ));
        }
        match first_unreachable {
            Some(receiver) => Err(TransportError::Unreachable(receiver)),
            None => Ok(()),
        }
    }

    fn recv(&mut self) -> Option<BlockMessage> {
        if self.net.is_down(self.my_id) {
            return None;
        }
        let cur = self.net.vid_of(self.my_id);

        {
            let mut future = self.net.block_future.lock().unwrap();
            if let Some(buffered) = future.get_mut(&self.my_id) {
                if let Some(position) = buffered.iter().position(|(vid, _)| *vid == cur) {
                    return Some(buffered.remove(position).1);
                }
            }
        }

        loop {
            let (vid, block) = self
                .net
                .block_inboxes
                .lock()
                .unwrap()
                .get_mut(&self.my_id)?
                .pop_front()?;
            if vid < cur {
                continue;
            }
            if vid == cur {
                return Some(block);
            }
            self.net
                .block_future
                .lock()
                .unwrap()
                .entry(self.my_id)
                .or_default()
                .push((vid, block));
        }
    }
}

/// Create the mock network connecting `nodes`. The i-th fabric/transport pair belongs to the
/// i-th node. Include every node that will ever join.
pub(crate) fn mock_network(
    nodes: &[Node],
) -> (Vec<TestFabric>, Vec<TestBlockTransport>, Arc<ClusterNet>) {
    let net = Arc::new(ClusterNet {
        row_inboxes: Mutex::new(
            nodes
                .iter()
                .map(|n| (n.id, VecDeque::new()))
                .collect(),
        ),
        row_future: Mutex::new(HashMap::new()),
        block_inboxes: Mutex::new(
            nodes
                .iter()
                .map(|n| (n.id, VecDeque::new()))
                .collect(),
        ),
        block_future: Mutex::new(HashMap::new()),
        current_vid: Mutex::new(HashMap::new()),
        down: Mutex::new(HashSet::new()),
    });
    let fabrics = nodes
        .iter()
        .map(|n| TestFabric {
            my_id: n.id,
            net: net.clone(),
        })
        .collect();
    let transports = nodes
        .iter()
        .map(|n| TestBlockTransport {
            my_id: n.id,
            net: net.clone(),
        })
        .collect();
    (fabrics, transports, net)
}

/// A replicated append-only byte log, standing in for an application's replicated object.
pub(crate) struct AppendLog(pub Vec<u8>);

impl ReplicatedState for AppendLog {
    fn serialize(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn install(&mut self, bytes: &[u8]) {
        self.0 = bytes.to_vec();
    }
}

/// One record of a delivery upcall.
pub(crate) type Delivered = (u32, i64, Vec<u8>);

pub(crate) struct TestNode {
    pub node: Node,
    pub group: Group<TestFabric, TestBlockTransport>,
    pub delivered: Arc<Mutex<Vec<Delivered>>>,
    pub state: Arc<Mutex<AppendLog>>,
    pub vids: Arc<Mutex<Vec<i32>>>,
}

pub(crate) fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .expect("Failed to bind an ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

pub(crate) fn make_node(id: u32) -> Node {
    Node::new(
        NodeId::new(id),
        NodeAddress::new(
            Ipv4Addr::LOCALHOST,
            free_port(),
            free_port(),
            free_port(),
            free_port(),
        ),
    )
}

pub(crate) fn test_config(node: Node, suspicion_timeout: Duration) -> Configuration {
    Configuration {
        identity: IdentityConfig { my_node: node },
        sst: SstConfig {
            changes_capacity: 8,
            fabric_device_id: None,
        },
        multicast: MulticastConfig {
            window_size: WindowSize::new(16),
            max_payload_size: PayloadSize::new(1 << 16),
            max_inline_payload_size: PayloadSize::new(64),
            rpc_window_size: WindowSize::new(16),
            p2p_window_size: WindowSize::new(16),
            null_send_timeout: Duration::from_millis(400),
        },
        membership: MembershipConfig {
            heartbeat_interval: Duration::from_millis(25),
            suspicion_timeout,
            socket_timeout: Duration::from_secs(15),
        },
        persistence_dir: None,
        log_events: false,
    }
}

/// Assemble and start one member. `registry` builds the node's subgroup registry; it must build
/// the same registrations on every node.
pub(crate) fn start_node(
    node: Node,
    initial_members: &[Node],
    fabric: TestFabric,
    transport: TestBlockTransport,
    suspicion_timeout: Duration,
    registry: impl FnOnce() -> SubgroupRegistry,
) -> TestNode {
    let (spec, delivered, state, vids) =
        build_spec(node, fabric, transport, suspicion_timeout, registry);
    let group = spec
        .start(initial_members.to_vec())
        .expect("Failed to start a group member");
    TestNode {
        node,
        group,
        delivered,
        state,
        vids,
    }
}

/// Assemble a member and join it through `leader_gms`. Blocks until the join is granted.
pub(crate) fn join_node(
    node: Node,
    leader_gms: std::net::SocketAddr,
    fabric: TestFabric,
    transport: TestBlockTransport,
    suspicion_timeout: Duration,
    registry: impl FnOnce() -> SubgroupRegistry,
) -> TestNode {
    let (spec, delivered, state, vids) =
        build_spec(node, fabric, transport, suspicion_timeout, registry);
    let group = spec.join(leader_gms).expect("Failed to join the group");
    TestNode {
        node,
        group,
        delivered,
        state,
        vids,
    }
}

type SpecParts = (
    GroupSpec<TestFabric, TestBlockTransport>,
    Arc<Mutex<Vec<Delivered>>>,
    Arc<Mutex<AppendLog>>,
    Arc<Mutex<Vec<i32>>>,
);

fn build_spec(
    node: Node,
    fabric: TestFabric,
    transport: TestBlockTransport,
    suspicion_timeout: Duration,
    registry: impl FnOnce() -> SubgroupRegistry,
) -> SpecParts {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(Mutex::new(AppendLog(Vec::new())));
    let vids = Arc::new(Mutex::new(Vec::new()));

    let delivery = {
        let delivered = delivered.clone();
        let state = state.clone();
        Box::new(move |ctx: &UpcallContext, seq: SequenceNumber, payload: &[u8]| {
            delivered
                .lock()
                .unwrap()
                .push((ctx.subgroup.int(), seq.int(), payload.to_vec()));
            state.lock().unwrap().0.extend_from_slice(payload);
        })
    };
    let view_callback = {
        let vids = vids.clone();
        Box::new(move |view: &View| {
            vids.lock().unwrap().push(view.vid.int());
        })
    };

    let mut state_registry = StateRegistry::new();
    let state_dyn: Arc<Mutex<dyn ReplicatedState>> = state.clone();
    state_registry.register(TypeTag::new(1), state_dyn);

    let spec = GroupSpec::new(
        test_config(node, suspicion_timeout),
        fabric,
        transport,
        delivery,
    )
    .with_subgroups(registry())
    .with_state(state_registry)
    .with_view_callback(view_callback);

    (spec, delivered, state, vids)
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Send, re-attempting while the group is wedged for a view change.
pub(crate) fn send_retry(
    node: &TestNode,
    subgroup: SubgroupId,
    payload: &[u8],
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        match node.group.send(subgroup, payload) {
            Ok(()) => return,
            Err(squall::multicast::SendError::Wedged) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("send failed: {:?}", err),
        }
    }
}
