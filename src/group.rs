/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that assemble and start a group member, and [the type](Group) that keeps it alive.
//!
//! A process either [bootstraps](GroupSpec::start) a group together with a known initial
//! membership, or [joins](GroupSpec::join) a running group through its leader. Either way the
//! result is a [`Group`]: dropping it shuts the member down.
//!
//! The builder collects the pluggable pieces: the state-table [`Fabric`], the
//! [`BlockTransport`], the subgroup and replicated-state registries, the upward callbacks, and
//! optional per-event handlers.

use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::layout::{LayoutError, SubgroupRegistry};
use crate::membership::join::{request_join, JoinError, StateRegistry};
use crate::membership::join::start_join_listener;
use crate::membership::manager::{
    Epoch, EpochContext, GroupShared, RowInit, ViewCallback, ViewManager,
};
use crate::multicast::transport::BlockTransport;
use crate::multicast::{DeliveryCallback, PersistenceCallback, SendError};
use crate::p2p::PendingRequests;
use crate::sst::fabric::Fabric;
use crate::types::{
    data_types::{SubgroupId, ViewId},
    node::Node,
    view::View,
};

/// Why a member could not be started.
#[derive(Debug)]
pub enum StartError {
    /// The local node is not in the membership it was asked to start with.
    NotAMember,
    /// The initial (or joined) view cannot satisfy the registered subgroup policies.
    InadequatelyProvisioned,
    /// The join listener socket could not be bound.
    Listener(std::io::Error),
    /// The join handshake with the leader failed.
    Join(JoinError),
}

impl From<LayoutError> for StartError {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::InadequatelyProvisioned => StartError::InadequatelyProvisioned,
        }
    }
}

/// Specification of a group member, built up and then consumed by [`start`](Self::start) or
/// [`join`](Self::join).
pub struct GroupSpec<F: Fabric, T: BlockTransport> {
    config: Configuration,
    fabric: F,
    transport: T,
    subgroups: SubgroupRegistry,
    state: StateRegistry,
    delivery: DeliveryCallback,
    persistence: Option<PersistenceCallback>,
    view_callback: Option<ViewCallback>,
    view_installed_handler: Option<HandlerPtr<ViewInstalledEvent>>,
    suspect_handler: Option<HandlerPtr<SuspectEvent>>,
    propose_change_handler: Option<HandlerPtr<ProposeChangeEvent>>,
    commit_changes_handler: Option<HandlerPtr<CommitChangesEvent>>,
    wedge_handler: Option<HandlerPtr<WedgeEvent>>,
    global_min_ready_handler: Option<HandlerPtr<GlobalMinReadyEvent>>,
    deliver_handler: Option<HandlerPtr<DeliverEvent>>,
    receive_join_request_handler: Option<HandlerPtr<ReceiveJoinRequestEvent>>,
    send_state_transfer_handler: Option<HandlerPtr<SendStateTransferEvent>>,
}

impl<F: Fabric, T: BlockTransport> GroupSpec<F, T> {
    pub fn new(config: Configuration, fabric: F, transport: T, delivery: DeliveryCallback) -> Self {
        Self {
            config,
            fabric,
            transport,
            subgroups: SubgroupRegistry::new(),
            state: StateRegistry::new(),
            delivery,
            persistence: None,
            view_callback: None,
            view_installed_handler: None,
            suspect_handler: None,
            propose_change_handler: None,
            commit_changes_handler: None,
            wedge_handler: None,
            global_min_ready_handler: None,
            deliver_handler: None,
            receive_join_request_handler: None,
            send_state_transfer_handler: None,
        }
    }

    /// Replace the subgroup registry. Registration order determines subgroup IDs and must match
    /// on every member.
    pub fn with_subgroups(mut self, subgroups: SubgroupRegistry) -> Self {
        self.subgroups = subgroups;
        self
    }

    /// Replace the replicated-state registry used for state transfer to joiners.
    pub fn with_state(mut self, state: StateRegistry) -> Self {
        self.state = state;
        self
    }

    /// Register the persistence watermark callback.
    pub fn with_persistence(mut self, persistence: PersistenceCallback) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register the view upcall, invoked after every successful install.
    pub fn with_view_callback(mut self, callback: ViewCallback) -> Self {
        self.view_callback = Some(callback);
        self
    }

    pub fn with_view_installed_handler(mut self, handler: HandlerPtr<ViewInstalledEvent>) -> Self {
        self.view_installed_handler = Some(handler);
        self
    }

    pub fn with_suspect_handler(mut self, handler: HandlerPtr<SuspectEvent>) -> Self {
        self.suspect_handler = Some(handler);
        self
    }

    pub fn with_propose_change_handler(mut self, handler: HandlerPtr<ProposeChangeEvent>) -> Self {
        self.propose_change_handler = Some(handler);
        self
    }

    pub fn with_commit_changes_handler(mut self, handler: HandlerPtr<CommitChangesEvent>) -> Self {
        self.commit_changes_handler = Some(handler);
        self
    }

    pub fn with_wedge_handler(mut self, handler: HandlerPtr<WedgeEvent>) -> Self {
        self.wedge_handler = Some(handler);
        self
    }

    pub fn with_global_min_ready_handler(
        mut self,
        handler: HandlerPtr<GlobalMinReadyEvent>,
    ) -> Self {
        self.global_min_ready_handler = Some(handler);
        self
    }

    pub fn with_deliver_handler(mut self, handler: HandlerPtr<DeliverEvent>) -> Self {
        self.deliver_handler = Some(handler);
        self
    }

    pub fn with_receive_join_request_handler(
        mut self,
        handler: HandlerPtr<ReceiveJoinRequestEvent>,
    ) -> Self {
        self.receive_join_request_handler = Some(handler);
        self
    }

    pub fn with_send_state_transfer_handler(
        mut self,
        handler: HandlerPtr<SendStateTransferEvent>,
    ) -> Self {
        self.send_state_transfer_handler = Some(handler);
        self
    }

    /// Bootstrap a new group: every node in `initial_members` starts with this same list and
    /// installs view 0 locally.
    pub fn start(self, initial_members: Vec<Node>) -> Result<Group<F, T>, StartError> {
        let my_id = self.config.identity.my_node.id;
        let my_rank = initial_members
            .iter()
            .position(|n| n.id == my_id)
            .ok_or(StartError::NotAMember)?;

        let mut view = View::new(
            ViewId::init(),
            initial_members.iter().map(|n| n.id).collect(),
            initial_members.iter().map(|n| n.address).collect(),
            vec![false; initial_members.len()],
            initial_members.iter().map(|n| n.id).collect(),
            Vec::new(),
            my_rank,
        );
        self.subgroups.provision(&mut view)?;

        self.launch(view, None)
    }

    /// Join a running group through its leader's join listener. Blocks until the leader commits
    /// the join and transfers the replicated state, then comes up directly in the new view.
    pub fn join(self, leader: SocketAddr) -> Result<Group<F, T>, StartError> {
        let my_node = self.config.identity.my_node;
        let grant = request_join(leader, my_node, self.config.membership.socket_timeout)
            .map_err(StartError::Join)?;

        let mut view = grant
            .new_view
            .into_view(my_node.id)
            .ok_or(StartError::NotAMember)?;
        self.subgroups.provision(&mut view)?;

        for (subgroup, bytes) in &grant.state.subgroups {
            self.state.install_at(*subgroup as usize, bytes);
        }

        self.launch(view, Some(grant.watermarks))
    }

    fn launch(
        self,
        view: View,
        joiner_watermarks: Option<crate::membership::join::ChangeLogWatermarks>,
    ) -> Result<Group<F, T>, StartError> {
        let my_node = self.config.identity.my_node;

        // Event bus: only started when some handler (or logging) is configured.
        let event_handlers = EventHandlers::new(
            self.config.log_events,
            self.view_installed_handler,
            self.suspect_handler,
            self.propose_change_handler,
            self.commit_changes_handler,
            self.wedge_handler,
            self.global_min_ready_handler,
            self.deliver_handler,
            self.receive_join_request_handler,
            self.send_state_transfer_handler,
        );
        let (event_publisher, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (shutdown, shutdown_receiver) = mpsc::channel();
            let handle = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
            (Some(event_publisher), Some(handle), Some(shutdown))
        };

        let (notices, notices_receiver) = mpsc::channel();

        let listener = TcpListener::bind(my_node.address.gms_addr()).map_err(StartError::Listener)?;
        let (listener_shutdown, listener_shutdown_receiver) = mpsc::channel();
        let listener_thread = start_join_listener(
            listener,
            self.config.membership.socket_timeout,
            notices.clone(),
            event_publisher.clone(),
            listener_shutdown_receiver,
        );

        let ctx = EpochContext {
            config: self.config,
            fabric: self.fabric,
            transport: self.transport,
            delivery: Arc::new(Mutex::new(self.delivery)),
            persistence: self.persistence.map(|p| Arc::new(Mutex::new(p))),
            notices,
            event_publisher: event_publisher.clone(),
        };

        let view = Arc::new(view);
        let row_init = match joiner_watermarks {
            Some(watermarks) => RowInit::Joiner(watermarks),
            None => RowInit::Fresh,
        };
        let epoch = Epoch::start(&ctx, view.clone(), row_init);

        let shared = Arc::new(GroupShared::new(view.clone(), &epoch.engine));
        let pending_p2p = Arc::new(PendingRequests::new());

        let manager = ViewManager::new(
            ctx,
            my_node.id,
            (*view).clone(),
            epoch,
            Arc::new(self.subgroups),
            Arc::new(self.state),
            shared.clone(),
            pending_p2p.clone(),
            self.view_callback,
        );
        let (manager_shutdown, manager_shutdown_receiver) = mpsc::channel();
        let manager_thread = manager.start(notices_receiver, manager_shutdown_receiver);

        Event::ViewInstalled(ViewInstalledEvent {
            timestamp: std::time::SystemTime::now(),
            vid: view.vid,
            members: view.members.clone(),
        })
        .publish(&event_publisher);

        Ok(Group {
            shared,
            pending_p2p,
            manager: Some(manager_thread),
            manager_shutdown,
            listener: Some(listener_thread),
            listener_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A running group member. Dropping it shuts the member down.
pub struct Group<F: Fabric, T: BlockTransport> {
    shared: Arc<GroupShared<F, T>>,
    pending_p2p: Arc<PendingRequests>,
    manager: Option<JoinHandle<()>>,
    manager_shutdown: Sender<()>,
    listener: Option<JoinHandle<()>>,
    listener_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<F: Fabric, T: BlockTransport> Group<F, T> {
    /// Multicast `payload` in `subgroup` within the current view.
    ///
    /// During a view change there is no engine to accept the send; the call returns
    /// [`SendError::Wedged`] and the application re-attempts once the next view is installed.
    pub fn send(&self, subgroup: SubgroupId, payload: &[u8]) -> Result<(), SendError> {
        let engine = self.shared.engine.lock().unwrap().upgrade();
        match engine {
            Some(engine) => engine.send(subgroup, payload),
            None => Err(SendError::Wedged),
        }
    }

    /// A snapshot of the current view.
    pub fn current_view(&self) -> Arc<View> {
        self.shared.view.lock().unwrap().clone()
    }

    /// The pending point-to-point result table, for the RPC layer layered above this crate.
    pub fn pending_p2p(&self) -> &Arc<PendingRequests> {
        &self.pending_p2p
    }
}

impl<F: Fabric, T: BlockTransport> Drop for Group<F, T> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown matters. The manager goes first and tears down
        // the epoch threads it owns; the join listener feeds the manager and goes second; the
        // event bus goes last so that events published during teardown still fire.

        let _ = self.manager_shutdown.send(());
        if let Some(handle) = self.manager.take() {
            let _ = handle.join();
        }

        let _ = self.listener_shutdown.send(());
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }

        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.event_bus.take() {
            let _ = handle.join();
        }
    }
}
