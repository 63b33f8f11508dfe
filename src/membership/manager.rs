/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view manager: the hub that owns the current view's resources and drives the
//! wedge → ragged-edge cleanup → install protocol.
//!
//! ## Ownership
//!
//! The manager exclusively owns the current [`View`], its [`SharedStateTable`], and the current
//! [`MulticastEngine`]; together with the per-view threads (fabric poller, predicate thread,
//! failure detector) these form an [`Epoch`], torn down wholesale when the next view is
//! installed. The engine never calls back into the manager: everything flows to the manager
//! thread through one [`ProtocolEvent`] queue, fed by the predicate thread, the failure
//! detector, and the join listener.
//!
//! ## The state machine
//!
//! Within one view a member moves through: ACTIVE → (suspicion or join request) PROPOSING →
//! (quorum of acks) COMMITTED → WEDGING → (all survivors wedged) CLEANING → (every shard's
//! `global_min` ready, ragged edge delivered) INSTALLED. The manager re-derives the stage from
//! the table on every step, so every transition is idempotent and crash-consistent.

use std::net::TcpStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::config::Configuration;
use crate::events::{
    CommitChangesEvent, Event, ProposeChangeEvent, SuspectEvent, ViewInstalledEvent,
    SendStateTransferEvent, GlobalMinReadyEvent,
};
use crate::layout::SubgroupRegistry;
use crate::multicast::{engine::MulticastEngine, transport::BlockTransport, DeliveryCallback,
    PersistenceCallback};
use crate::p2p::PendingRequests;
use crate::sst::{
    fabric::{start_fabric_poller, Fabric},
    layout::{RowLayout, SstGeometry},
    predicates::{start_predicate_thread, PredicateMode, Predicates},
    SharedStateTable,
};
use crate::types::{
    data_types::{NodeId, SubgroupId},
    node::Node,
    view::{View, ViewBytes},
};

use super::failure_detector::start_failure_detector;
use super::join::{send_join_grant, ChangeLogWatermarks, StateRegistry, StateTransfer};
use super::protocol;

/// Invoked after every successful view install.
pub type ViewCallback = Box<dyn FnMut(&View) + Send>;

/// Everything that can wake the view manager.
pub(crate) enum ProtocolEvent {
    /// The failure detector (or a fabric write failure) suspects the member at this rank.
    Suspect { rank: usize },
    /// A joiner handed its identity and its open socket to the join listener.
    JoinRequest { node: Node, stream: TcpStream },
    /// Some row's membership counters or flags advanced.
    MembershipChanged,
}

/// The per-view resources: table, predicate registry, threads, and engine. Constructed at
/// install, destroyed at the next install.
pub(crate) struct Epoch<F: Fabric, T: BlockTransport> {
    pub(crate) table: Arc<SharedStateTable<F>>,
    pub(crate) engine: Arc<MulticastEngine<F, T>>,
    predicate_thread: Option<JoinHandle<()>>,
    predicate_shutdown: Sender<()>,
    poller_thread: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    detector_thread: Option<JoinHandle<()>>,
    detector_shutdown: Sender<()>,
}

/// How the local row of a fresh table gets its change-log position.
pub(crate) enum RowInit<'a, F: Fabric> {
    /// The first view a group bootstraps with; everything starts from zero.
    Fresh,
    /// Carried over from the previous view's table at install.
    FromPrevious {
        old: &'a SharedStateTable<F>,
        changes_installed: i64,
    },
    /// A joiner starts from the watermarks the leader granted.
    Joiner(ChangeLogWatermarks),
}

/// Shared context the manager threads all epochs out of.
pub(crate) struct EpochContext<F: Fabric, T: BlockTransport> {
    pub(crate) config: Configuration,
    pub(crate) fabric: F,
    pub(crate) transport: T,
    pub(crate) delivery: Arc<Mutex<DeliveryCallback>>,
    pub(crate) persistence: Option<Arc<Mutex<PersistenceCallback>>>,
    pub(crate) notices: Sender<ProtocolEvent>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<F: Fabric, T: BlockTransport> Epoch<F, T> {
    /// Bring up the whole per-view stack for `view`: rebind the fabric and transport, build the
    /// table, initialize the local row, start the engine, and spawn the poller, predicate, and
    /// detector threads.
    pub(crate) fn start(
        ctx: &EpochContext<F, T>,
        view: Arc<View>,
        row_init: RowInit<'_, F>,
    ) -> Self {
        let mut fabric = ctx.fabric.clone();
        fabric.install_view(&view);
        let mut transport = ctx.transport.clone();
        transport.install_view(&view);

        let geometry = SstGeometry::for_view(
            &view,
            ctx.config.multicast.window_size,
            ctx.config.multicast.max_inline_payload_size,
            ctx.config.sst.changes_capacity,
        );
        let table = Arc::new(SharedStateTable::new(
            view.vid,
            RowLayout::new(geometry),
            view.members.clone(),
            view.my_rank,
            fabric.clone(),
        ));

        match row_init {
            RowInit::Fresh => (),
            RowInit::FromPrevious {
                old,
                changes_installed,
            } => protocol::init_row_from_previous(old, &table, changes_installed),
            RowInit::Joiner(watermarks) => {
                let row = table.my_row();
                row.set_num_changes(watermarks.num_changes);
                row.set_num_committed(watermarks.num_committed);
                row.set_num_installed(watermarks.num_installed);
                row.set_num_acked(watermarks.num_changes);
                for (offset, (id, address)) in watermarks.pending.iter().enumerate() {
                    let index = watermarks.num_installed + offset as i64;
                    row.set_change(index, *id);
                    row.set_joiner_ip(index, *address);
                }
            }
        }

        let predicates = Arc::new(Predicates::new());
        register_membership_predicate(&predicates, ctx.notices.clone());

        // The application's callbacks outlive any single engine; each view's engine gets a thin
        // forwarder onto the shared closure.
        let delivery = {
            let shared = ctx.delivery.clone();
            Box::new(move |upcall_ctx: &crate::multicast::UpcallContext, seq, payload: &[u8]| {
                let mut delivery = shared.lock().unwrap();
                (*delivery)(upcall_ctx, seq, payload)
            }) as DeliveryCallback
        };
        let persistence = ctx.persistence.as_ref().map(|shared| {
            let shared = shared.clone();
            Box::new(
                move |upcall_ctx: &crate::multicast::UpcallContext, version| {
                    let mut persistence = shared.lock().unwrap();
                    (*persistence)(upcall_ctx, version)
                },
            ) as PersistenceCallback
        });

        let engine = MulticastEngine::start(
            &view,
            table.clone(),
            predicates.clone(),
            transport,
            &ctx.config.multicast,
            delivery,
            persistence,
            ctx.event_publisher.clone(),
        );

        let (poller_shutdown, poller_shutdown_receiver) = std::sync::mpsc::channel();
        let poller_thread =
            start_fabric_poller(fabric, table.clone(), poller_shutdown_receiver);

        let (predicate_shutdown, predicate_shutdown_receiver) = std::sync::mpsc::channel();
        let predicate_thread = start_predicate_thread(
            table.clone(),
            predicates.clone(),
            predicate_shutdown_receiver,
        );

        let (detector_shutdown, detector_shutdown_receiver) = std::sync::mpsc::channel();
        let detector_thread = start_failure_detector(
            view.clone(),
            table.clone(),
            ctx.config.membership.clone(),
            ctx.notices.clone(),
            detector_shutdown_receiver,
        );

        // Push the initialized row out so peers see our starting watermarks.
        table.put_all();

        Self {
            table,
            engine,
            predicate_thread: Some(predicate_thread),
            predicate_shutdown,
            poller_thread: Some(poller_thread),
            poller_shutdown,
            detector_thread: Some(detector_thread),
            detector_shutdown,
        }
    }

    /// Tear the epoch down. The engine stops first (it uses the predicate registry), then the
    /// detector, the predicate thread, and finally the poller, which everything else reads
    /// through.
    pub(crate) fn shutdown(mut self) {
        self.engine.shutdown();

        let _ = self.detector_shutdown.send(());
        if let Some(handle) = self.detector_thread.take() {
            let _ = handle.join();
        }
        let _ = self.predicate_shutdown.send(());
        if let Some(handle) = self.predicate_thread.take() {
            let _ = handle.join();
        }
        let _ = self.poller_shutdown.send(());
        if let Some(handle) = self.poller_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Register the predicate that watches every row's membership counters and flags and nudges the
/// manager whenever any of them advances. All watched quantities are monotone, so their sum is a
/// monotone digest: the predicate fires exactly when the digest grows.
fn register_membership_predicate<F: Fabric>(
    predicates: &Predicates<F>,
    notices: Sender<ProtocolEvent>,
) {
    let last_digest = Arc::new(Mutex::new(-1i64));

    let digest = |table: &SharedStateTable<F>| -> i64 {
        let mut total = 0i64;
        let num_members = table.num_members();
        for rank in 0..num_members {
            let row = table.row(rank);
            total += row.num_changes() + row.num_committed() + row.num_acked()
                + row.num_installed();
            total += row.wedged() as i64;
            for suspect in 0..num_members {
                total += row.suspected(suspect) as i64;
            }
            for subgroup in 0..table.layout().geometry().num_subgroups {
                total += row.global_min_ready(SubgroupId::new(subgroup as u32)) as i64;
            }
        }
        total
    };

    let predicate = {
        let last_digest = last_digest.clone();
        Box::new(move |table: &SharedStateTable<F>| digest(table) > *last_digest.lock().unwrap())
    };
    let action = Box::new(move |table: &SharedStateTable<F>| {
        *last_digest.lock().unwrap() = digest(table);
        let _ = notices.send(ProtocolEvent::MembershipChanged);
    });
    predicates.register(predicate, action, PredicateMode::Recurring);
}

/// Handle through which the application-facing [`Group`](crate::group::Group) reaches the
/// manager-owned state: the current view and a weak reference to the current engine.
pub(crate) struct GroupShared<F: Fabric, T: BlockTransport> {
    pub(crate) engine: Mutex<Weak<MulticastEngine<F, T>>>,
    pub(crate) view: Mutex<Arc<View>>,
}

impl<F: Fabric, T: BlockTransport> GroupShared<F, T> {
    pub(crate) fn new(view: Arc<View>, engine: &Arc<MulticastEngine<F, T>>) -> Self {
        Self {
            engine: Mutex::new(Arc::downgrade(engine)),
            view: Mutex::new(view),
        }
    }

    fn rebind(&self, view: Arc<View>, engine: &Arc<MulticastEngine<F, T>>) {
        *self.engine.lock().unwrap() = Arc::downgrade(engine);
        *self.view.lock().unwrap() = view;
    }
}

struct PendingJoin {
    node: Node,
    stream: TcpStream,
    proposed: bool,
}

/// The view manager. Runs on its own thread; see the [module docs](self).
pub(crate) struct ViewManager<F: Fabric, T: BlockTransport> {
    ctx: EpochContext<F, T>,
    my_id: NodeId,
    /// The manager's mutable image of the current view; `failed` bits advance here first.
    working_view: View,
    epoch: Option<Epoch<F, T>>,
    subgroups: Arc<SubgroupRegistry>,
    state: Arc<StateRegistry>,
    shared: Arc<GroupShared<F, T>>,
    pending_p2p: Arc<PendingRequests>,
    view_callback: Option<ViewCallback>,
    pending_joins: Vec<PendingJoin>,
    /// Set when a committed change could not be installed because the candidate view was
    /// inadequately provisioned; retried when the membership advances again.
    install_deferred: bool,
}

impl<F: Fabric, T: BlockTransport> ViewManager<F, T> {
    pub(crate) fn new(
        ctx: EpochContext<F, T>,
        my_id: NodeId,
        working_view: View,
        epoch: Epoch<F, T>,
        subgroups: Arc<SubgroupRegistry>,
        state: Arc<StateRegistry>,
        shared: Arc<GroupShared<F, T>>,
        pending_p2p: Arc<PendingRequests>,
        view_callback: Option<ViewCallback>,
    ) -> Self {
        Self {
            ctx,
            my_id,
            working_view,
            epoch: Some(epoch),
            subgroups,
            state,
            shared,
            pending_p2p,
            view_callback,
            pending_joins: Vec::new(),
            install_deferred: false,
        }
    }

    /// Spawn the manager thread.
    pub(crate) fn start(
        mut self,
        notices: Receiver<ProtocolEvent>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => {
                    if let Some(epoch) = self.epoch.take() {
                        epoch.shutdown();
                    }
                    return;
                }
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("View manager thread disconnected from main thread")
                }
            }

            match notices.recv_timeout(Duration::from_millis(20)) {
                Ok(event) => {
                    self.handle(event);
                    while let Ok(event) = notices.try_recv() {
                        self.handle(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            self.step();
        })
    }

    fn handle(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Suspect { rank } => self.mark_failed(rank),
            ProtocolEvent::JoinRequest { node, stream } => {
                if self.working_view.rank_of(node.id).is_some() {
                    log::warn!("join request from node {} which is already a member", node.id);
                    return;
                }
                if !self.working_view.i_am_leader() {
                    log::warn!(
                        "join request from node {} reached a non-leader; dropping",
                        node.id
                    );
                    return;
                }
                self.pending_joins.push(PendingJoin {
                    node,
                    stream,
                    proposed: false,
                });
            }
            ProtocolEvent::MembershipChanged => (),
        }
    }

    /// One idempotent pass over the membership state machine. Every stage is re-derived from the
    /// table, so repeating a pass is harmless.
    fn step(&mut self) {
        let (table, engine) = match self.epoch.as_ref() {
            Some(epoch) => (epoch.table.clone(), epoch.engine.clone()),
            None => return,
        };

        self.adopt_suspicions();

        // PROPOSING: the leader turns join requests into change-log entries; departures were
        // already appended by `merge_changes` when the suspicion landed. A leader that
        // inherited the role acts only once its claim is visible on every surviving row.
        let i_lead = protocol::i_am_established_leader(&self.working_view, &table);
        if i_lead {
            for pending in self.pending_joins.iter_mut().filter(|p| !p.proposed) {
                if protocol::propose_join(&table, pending.node) {
                    pending.proposed = true;
                    Event::ProposeChange(ProposeChangeEvent {
                        timestamp: SystemTime::now(),
                        change: pending.node.id,
                        is_join: true,
                        num_changes: table.my_row().num_changes(),
                    })
                    .publish(&self.ctx.event_publisher);
                }
            }
        }

        // A leader that established itself after the suspicion landed (or whose earlier
        // proposal attempt predates its leadership) makes sure every failure is listed.
        if i_lead {
            let my_row = table.my_row();
            let unlisted_failure = (0..self.working_view.num_members()).any(|n| {
                self.working_view.failed[n]
                    && !(my_row.num_installed()..my_row.num_changes())
                        .any(|c| my_row.change(c) == self.working_view.members[n])
            });
            if unlisted_failure {
                protocol::merge_changes(&self.working_view, &table);
            }
        }

        // Everyone adopts longer logs and acknowledges them.
        protocol::acknowledge_changes(&self.working_view, &table);

        // COMMITTED: the leader advances the commit watermark on a quorum of acks.
        if i_lead {
            if let Some(num_committed) = protocol::try_commit(&self.working_view, &table) {
                Event::CommitChanges(CommitChangesEvent {
                    timestamp: SystemTime::now(),
                    num_committed,
                })
                .publish(&self.ctx.event_publisher);
            }
        }

        // WEDGING: committed-but-uninstalled changes oblige every member to wedge.
        if protocol::changes_committed(&self.working_view, &table) {
            engine.wedge();
        }

        // CLEANING: once every survivor is wedged, shard leaders publish the ragged-edge cutoff,
        // and once every cutoff this node depends on is ready, the view is installed.
        if engine.is_wedged() && protocol::all_survivors_wedged(&self.working_view, &table) {
            let my_subgroups: Vec<(SubgroupId, usize)> = self
                .working_view
                .my_subgroups
                .iter()
                .map(|(subgroup, shard)| (*subgroup, *shard))
                .collect();

            for (subgroup, shard_index) in &my_subgroups {
                let shard =
                    &self.working_view.subgroup_shard_views[subgroup.index()][*shard_index];
                let i_lead_shard = self
                    .working_view
                    .subview_rank_of_shard_leader(*subgroup, *shard_index)
                    == shard.my_rank;
                if i_lead_shard && !table.my_row().global_min_ready(*subgroup) {
                    protocol::publish_global_min(
                        &self.working_view,
                        &table,
                        *subgroup,
                        *shard_index,
                    );
                    Event::GlobalMinReady(GlobalMinReadyEvent {
                        timestamp: SystemTime::now(),
                        subgroup: *subgroup,
                    })
                    .publish(&self.ctx.event_publisher);
                }
            }

            let all_ready = my_subgroups.iter().all(|(subgroup, shard_index)| {
                protocol::read_global_min(&self.working_view, &table, *subgroup, *shard_index)
                    .is_some()
            });
            if all_ready {
                self.install_next_view();
            }
        }
    }

    /// Fold every visible suspicion (peers' suspected bits, unwritable rows) into the working
    /// view, wedging and proposing departures as required.
    fn adopt_suspicions(&mut self) {
        let table = match self.epoch.as_ref() {
            Some(epoch) => epoch.table.clone(),
            None => return,
        };
        for rank in 0..self.working_view.num_members() {
            if self.working_view.failed[rank] {
                continue;
            }
            let suspected_by_peer = (0..self.working_view.num_members())
                .filter(|o| !self.working_view.failed[*o])
                .any(|o| table.row(o).suspected(rank));
            if suspected_by_peer || table.is_unreachable(rank) {
                self.mark_failed(rank);
            }
        }
    }

    /// Record that the member at `rank` has failed: propagate the suspicion, wedge, and (as
    /// leader) propose the departure.
    fn mark_failed(&mut self, rank: usize) {
        if rank == self.working_view.my_rank || self.working_view.failed[rank] {
            return;
        }
        let (table, engine) = match self.epoch.as_ref() {
            Some(epoch) => (epoch.table.clone(), epoch.engine.clone()),
            None => return,
        };

        self.working_view.failed[rank] = true;
        self.working_view.num_failed += 1;
        if self.working_view.num_failed > self.working_view.num_members() / 2 {
            panic!(
                "Potential partitioning event: {} of {} members have failed; aborting",
                self.working_view.num_failed,
                self.working_view.num_members()
            );
        }

        Event::Suspect(SuspectEvent {
            timestamp: SystemTime::now(),
            suspect: self.working_view.members[rank],
        })
        .publish(&self.ctx.event_publisher);

        let row = table.my_row();
        row.set_suspected(rank, true);
        table.put_range(table.layout().suspected_range());

        engine.wedge();

        if protocol::i_am_established_leader(&self.working_view, &table) {
            protocol::merge_changes(&self.working_view, &table);
            Event::ProposeChange(ProposeChangeEvent {
                timestamp: SystemTime::now(),
                change: self.working_view.members[rank],
                is_join: false,
                num_changes: table.my_row().num_changes(),
            })
            .publish(&self.ctx.event_publisher);
        }
    }

    /// CLEANING → INSTALLED: deliver the ragged edge, construct and provision the next view,
    /// grant pending joins, fail pending p2p results addressed to the departed, and swap epochs.
    fn install_next_view(&mut self) {
        let epoch = self.epoch.take().expect("Install requires a live epoch");
        let table = epoch.table.clone();

        let plan = protocol::plan_next_view(&self.working_view, &table);
        if plan.changes_installed == 0 {
            self.epoch = Some(epoch);
            return;
        }

        // Ragged-edge delivery: survivors of the transition deliver the same multiset.
        epoch.engine.quiesce_delivery();
        let my_subgroups: Vec<(SubgroupId, usize)> = self
            .working_view
            .my_subgroups
            .iter()
            .map(|(subgroup, shard)| (*subgroup, *shard))
            .collect();
        for (subgroup, shard_index) in &my_subgroups {
            if let Some(global_min) = protocol::read_global_min(
                &self.working_view,
                &table,
                *subgroup,
                *shard_index,
            ) {
                epoch.engine.deliver_ragged_edge(*subgroup, &global_min);
            }
        }

        // Construct and provision the candidate view.
        let Some(my_rank) = plan.members.iter().position(|m| *m == self.my_id) else {
            panic!("Protocol violation: the local node was removed from its own next view");
        };
        let mut candidate = View::new(
            self.working_view.vid + 1,
            plan.members.clone(),
            plan.addresses.clone(),
            vec![false; plan.members.len()],
            plan.joined.iter().map(|n| n.id).collect(),
            plan.departed.clone(),
            my_rank,
        );
        if self.subgroups.provision(&mut candidate).is_err() {
            if !self.install_deferred {
                log::warn!(
                    "candidate view {} is inadequately provisioned; deferring the install",
                    candidate.vid
                );
                self.install_deferred = true;
            }
            self.epoch = Some(epoch);
            return;
        }
        fill_subview_churn(&self.working_view, &mut candidate);

        let old_view_bytes = ViewBytes::from(&self.working_view);
        let new_view_bytes = ViewBytes::from(&candidate);
        let watermarks = {
            let row = table.my_row();
            let num_installed = row.num_installed() + plan.changes_installed;
            let pending = (num_installed..row.num_changes())
                .map(|c| (row.change(c), row.joiner_ip(c)))
                .collect();
            ChangeLogWatermarks {
                num_changes: row.num_changes(),
                num_committed: row.num_committed(),
                num_installed,
                pending,
            }
        };

        // Grant pending joins over their held sockets, with the state of every subgroup the
        // joiner now belongs to.
        for pending in self
            .pending_joins
            .drain(..)
            .collect::<Vec<_>>()
        {
            let mut pending = pending;
            if !candidate.joined.contains(&pending.node.id) {
                self.pending_joins.push(pending);
                continue;
            }
            let state = state_for_joiner(&candidate, &*self.state, pending.node.id);
            for (subgroup, bytes) in &state.subgroups {
                Event::SendStateTransfer(SendStateTransferEvent {
                    timestamp: SystemTime::now(),
                    joiner: pending.node.id,
                    subgroup: SubgroupId::new(*subgroup),
                    num_bytes: bytes.len(),
                })
                .publish(&self.ctx.event_publisher);
            }
            if let Err(err) = send_join_grant(
                &mut pending.stream,
                &old_view_bytes,
                &new_view_bytes,
                &watermarks,
                &state,
            ) {
                log::warn!("state transfer to joiner {} failed: {:?}", pending.node.id, err);
            }
        }

        // Pending point-to-point results never block a view change: complete every result whose
        // target departed.
        self.pending_p2p.complete_departed(&plan.departed);

        // Swap epochs. The old stack is torn down first: its poller must not consume traffic
        // addressed to the new view's table, which the fabric buffers until the new poller runs.
        // The old table outlives its epoch here so the new row can be initialized from it.
        epoch.shutdown();
        let candidate = Arc::new(candidate);
        let new_epoch = Epoch::start(
            &self.ctx,
            candidate.clone(),
            RowInit::FromPrevious {
                old: &table,
                changes_installed: plan.changes_installed,
            },
        );
        self.shared.rebind(candidate.clone(), &new_epoch.engine);

        self.working_view = (*candidate).clone();
        self.install_deferred = false;
        self.epoch = Some(new_epoch);

        if let Some(callback) = self.view_callback.as_mut() {
            callback(&candidate);
        }
        Event::ViewInstalled(ViewInstalledEvent {
            timestamp: SystemTime::now(),
            vid: candidate.vid,
            members: candidate.members.clone(),
        })
        .publish(&self.ctx.event_publisher);
        log::info!("{}", candidate.debug_string());
    }
}

/// Fill each shard's `joined`/`departed` relative to the previous view's version of the same
/// shard.
pub(crate) fn fill_subview_churn(old_view: &View, new_view: &mut View) {
    for (subgroup, shards) in new_view.subgroup_shard_views.iter_mut().enumerate() {
        for (shard_index, shard) in shards.iter_mut().enumerate() {
            let old_members: &[NodeId] = old_view
                .subgroup_shard_views
                .get(subgroup)
                .and_then(|old_shards| old_shards.get(shard_index))
                .map(|old_shard| old_shard.members.as_slice())
                .unwrap_or(&[]);
            shard.joined = shard
                .members
                .iter()
                .copied()
                .filter(|m| !old_members.contains(m))
                .collect();
            shard.departed = old_members
                .iter()
                .copied()
                .filter(|m| !shard.members.contains(m))
                .collect();
        }
    }
}

/// Serialize, from the runtime state registry, the state of every subgroup the joiner is a
/// member of in the new view. Registry position and subgroup id coincide by construction.
fn state_for_joiner(
    new_view: &View,
    registry: &StateRegistry,
    joiner: NodeId,
) -> StateTransfer {
    let mut subgroups = Vec::new();
    for (subgroup, shards) in new_view.subgroup_shard_views.iter().enumerate() {
        let joiner_in_subgroup = shards
            .iter()
            .any(|shard| shard.members.contains(&joiner));
        if !joiner_in_subgroup {
            continue;
        }
        if let Some(bytes) = registry.serialize_at(subgroup) {
            subgroups.push((subgroup as u32, bytes));
        }
    }
    StateTransfer { subgroups }
}
