/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller, subsystem-specific
//! config structs before being passed to components.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{
    data_types::{PayloadSize, WindowSize},
    node::Node,
};

#[derive(Clone)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub sst: SstConfig,
    pub multicast: MulticastConfig,
    pub membership: MembershipConfig,
    /// Where the application's persistence sink keeps durable versions. Opaque to this crate;
    /// handed through to the sink.
    pub persistence_dir: Option<PathBuf>,
    /// Enable the default CSV logging handlers for every event.
    pub log_events: bool,
}

/// Who the local node is. `my_node.address.gms_port` is the port the join listener binds.
#[derive(Clone)]
pub struct IdentityConfig {
    pub my_node: Node,
}

#[derive(Clone)]
pub struct SstConfig {
    /// Capacity of the circular membership-change log. Bounds how many changes may be pending
    /// (proposed but uninstalled) at once.
    pub changes_capacity: usize,
    /// Which fabric device the state table binds, for providers that expose several. Opaque to
    /// this crate; handed through to the fabric.
    pub fabric_device_id: Option<u32>,
}

#[derive(Clone)]
pub struct MulticastConfig {
    /// Outstanding messages each sender may have per subgroup.
    pub window_size: WindowSize,
    /// Largest payload accepted by `send`.
    pub max_payload_size: PayloadSize,
    /// Payloads at most this large travel through the state table's inline slots; larger ones go
    /// through the block transport.
    pub max_inline_payload_size: PayloadSize,
    /// Window for replicated RPC sends layered above ordered multicast.
    pub rpc_window_size: WindowSize,
    /// Window for point-to-point sends.
    pub p2p_window_size: WindowSize,
    /// How long a sender may lag the round-robin rotation before the engine emits null messages
    /// on its behalf to let the global prefix complete.
    pub null_send_timeout: Duration,
}

#[derive(Clone)]
pub struct MembershipConfig {
    /// How often the failure detector publishes the local heartbeat frontier.
    pub heartbeat_interval: Duration,
    /// How long a member may show no progress before it is suspected.
    pub suspicion_timeout: Duration,
    /// Read/write timeouts on the join and state-transfer TCP sockets.
    pub socket_timeout: Duration,
}

impl Default for SstConfig {
    fn default() -> Self {
        Self {
            changes_capacity: 32,
            fabric_device_id: None,
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            window_size: WindowSize::new(16),
            max_payload_size: PayloadSize::new(1 << 20),
            max_inline_payload_size: PayloadSize::new(120),
            rpc_window_size: WindowSize::new(16),
            p2p_window_size: WindowSize::new(16),
            null_send_timeout: Duration::from_millis(50),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            suspicion_timeout: Duration::from_secs(2),
            socket_timeout: Duration::from_secs(15),
        }
    }
}
