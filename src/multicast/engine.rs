/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-view multicast engine.
//!
//! An engine is instantiated when a view is installed and destroyed when the next view is
//! installed; it is never reused. While it lives, it owns the send windows, the per-sender
//! receive rings, and the delivery thread for every subgroup the local node belongs to.
//!
//! ## How a message flows
//!
//! A sender acquires the next per-sender index `i`, waits for window space, and publishes the
//! payload: small payloads go into the state table's inline slots (payload words first, header
//! last), large payloads go through the [`BlockTransport`]. It then increments its own
//! `num_received` slot and publishes the slot before the counter.
//!
//! Receivers observe new messages from the predicate thread. Each received message `(k, i)`
//! advances the local `num_received[k]`, and `seq_num` is recomputed as the highest global
//! sequence number whose entire prefix has been received: `min over k of (S·n_k + k) − 1`.
//! `stable_num` is the minimum of `seq_num` across all non-failed rows, and delivery upcalls run
//! in `g`-order on the delivery thread once stability (or, for unordered shards, local receipt)
//! admits them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::config::MulticastConfig;
use crate::events::{DeliverEvent, Event, WedgeEvent};
use crate::sst::{
    fabric::Fabric,
    now_millis,
    predicates::{PredicateHandle, PredicateMode, Predicates},
    SharedStateTable,
};
use crate::types::{
    data_types::{NodeId, PayloadSize, SequenceNumber, SubgroupId, Version, ViewId, WindowSize},
    view::{Mode, View},
};

use super::transport::{BlockMessage, BlockTransport};
use super::{DeliveryCallback, PersistenceCallback, SendError, UpcallContext};

/// Static facts about one subgroup shard the local node belongs to, computed once at engine
/// construction from the view.
#[derive(Clone)]
struct SubgroupMeta {
    subgroup: SubgroupId,
    mode: Mode,
    /// View rank of each shard member, in shard rank order.
    member_view_ranks: Vec<usize>,
    /// View rank of each sender, in dense sender rank order.
    sender_view_ranks: Vec<usize>,
    /// Shard members other than the local node, for block sends.
    other_members: Vec<NodeId>,
    num_senders: usize,
    /// The local node's dense sender rank, if it sends in this shard.
    my_sender_rank: Option<usize>,
    /// First `num_received` slot of this shard.
    slot_base: usize,
}

impl SubgroupMeta {
    /// Global sequence number of message `index` from dense sender `sender_rank`.
    fn global_num(&self, sender_rank: usize, index: i64) -> i64 {
        sender_rank as i64 + self.num_senders as i64 * index
    }
}

/// Send-side state of one subgroup: the next per-sender index and when this sender last fed the
/// rotation. Held under a mutex so concurrent application senders serialize, which also
/// serializes their slot writes in program order.
struct SendState {
    next_index: i64,
    last_send: Instant,
}

/// Receive-side state of one subgroup, shared between the predicate thread (producer), the send
/// path (which loops the sender's own payloads back), and the delivery thread (consumer).
struct ReceiveState {
    /// Per dense sender rank: the next per-sender index to consume, across both paths.
    expected: Vec<i64>,
    /// Per dense sender rank: received, not yet delivered payloads in index order. `None` is a
    /// null message: it occupies its index in the rotation but is never delivered upward.
    rings: Vec<VecDeque<Option<Vec<u8>>>>,
    /// Per dense sender rank: block payloads that arrived ahead of their index, staged until the
    /// rotation reaches them.
    pending_blocks: Vec<BTreeMap<i64, Vec<u8>>>,
}

enum DeliveryJob {
    /// Deliver every message with global sequence number ≤ `upto`.
    Through { subgroup: SubgroupId, upto: i64 },
    /// Deliver a raw-mode payload immediately.
    Raw { subgroup: SubgroupId, payload: Vec<u8> },
}

struct Callbacks {
    delivery: DeliveryCallback,
    persistence: Option<PersistenceCallback>,
}

/// The delivery half of the engine, shared between the delivery thread and the ragged-edge
/// cleanup path (which runs on the view manager thread after the delivery thread is quiesced).
struct DeliveryCore<F: Fabric> {
    vid: ViewId,
    table: Arc<SharedStateTable<F>>,
    num_senders: HashMap<SubgroupId, usize>,
    receive_states: HashMap<SubgroupId, Arc<Mutex<ReceiveState>>>,
    callbacks: Mutex<Callbacks>,
    event_publisher: Option<Sender<Event>>,
}

impl<F: Fabric> DeliveryCore<F> {
    /// Deliver, in global sequence order, every undelivered message with `g ≤ upto`. Updates and
    /// publishes `delivered_num` and, if a persistence sink is registered, `persisted_num`.
    fn deliver_through(&self, subgroup: SubgroupId, upto: i64) {
        let num_senders = self.num_senders[&subgroup] as i64;
        let row = self.table.my_row();
        let mut delivered = row.delivered_num(subgroup).int();
        if upto <= delivered {
            return;
        }

        let mut callbacks = self.callbacks.lock().unwrap();
        let state = &self.receive_states[&subgroup];
        let ctx = UpcallContext {
            vid: self.vid,
            subgroup,
        };
        for g in (delivered + 1)..=upto {
            let sender_rank = (g % num_senders) as usize;
            let entry = state.lock().unwrap().rings[sender_rank].pop_front();
            let Some(entry) = entry else {
                // The prefix is incomplete; the admitting counter ran ahead of the rings.
                break;
            };
            delivered = g;
            // Nulls advance the rotation but never reach the application.
            let Some(payload) = entry else {
                continue;
            };
            (callbacks.delivery)(&ctx, SequenceNumber::new(g), &payload);
            Event::Deliver(DeliverEvent {
                timestamp: SystemTime::now(),
                subgroup,
                seq: SequenceNumber::new(g),
                payload,
            })
            .publish(&self.event_publisher);
        }

        row.set_delivered_num(subgroup, SequenceNumber::new(delivered));
        self.table
            .put_word(self.table.layout().delivered_num(subgroup));

        if let Some(persistence) = callbacks.persistence.as_mut() {
            let watermark = persistence(&ctx, Version::new(delivered));
            let watermark = watermark.int().min(delivered);
            row.set_persisted_num(subgroup, SequenceNumber::new(watermark));
            self.table
                .put_word(self.table.layout().persisted_num(subgroup));
        }
    }

    /// Deliver a raw-mode payload. Raw shards bypass sequencing, so the sequence number handed to
    /// the callback is the "nothing" sentinel.
    fn deliver_raw(&self, subgroup: SubgroupId, payload: &[u8]) {
        let ctx = UpcallContext {
            vid: self.vid,
            subgroup,
        };
        let mut callbacks = self.callbacks.lock().unwrap();
        (callbacks.delivery)(&ctx, SequenceNumber::init(), payload);
    }

    /// Ragged-edge delivery: deliver exactly `global_min[k]` messages from each sender `k` (no
    /// more, no fewer), in global sequence order, skipping the messages beyond each sender's
    /// cutoff. Called with the delivery thread quiesced.
    fn deliver_ragged(&self, subgroup: SubgroupId, global_min: &[i64]) {
        let num_senders = self.num_senders[&subgroup] as i64;
        let row = self.table.my_row();
        let mut delivered = row.delivered_num(subgroup).int();

        let max_g = global_min
            .iter()
            .enumerate()
            .filter(|(_, min)| **min > 0)
            .map(|(k, min)| k as i64 + num_senders * (min - 1))
            .max();
        let Some(max_g) = max_g else {
            return;
        };

        let mut callbacks = self.callbacks.lock().unwrap();
        let state = &self.receive_states[&subgroup];
        let ctx = UpcallContext {
            vid: self.vid,
            subgroup,
        };
        for g in (delivered + 1)..=max_g {
            let sender_rank = (g % num_senders) as usize;
            let index = g / num_senders;
            if index >= global_min[sender_rank] {
                continue;
            }
            let entry = state.lock().unwrap().rings[sender_rank].pop_front();
            let Some(entry) = entry else {
                break;
            };
            delivered = g;
            let Some(payload) = entry else {
                continue;
            };
            (callbacks.delivery)(&ctx, SequenceNumber::new(g), &payload);
            Event::Deliver(DeliverEvent {
                timestamp: SystemTime::now(),
                subgroup,
                seq: SequenceNumber::new(g),
                payload,
            })
            .publish(&self.event_publisher);
        }

        row.set_delivered_num(subgroup, SequenceNumber::new(delivered));
        self.table
            .put_word(self.table.layout().delivered_num(subgroup));
    }
}

/// The multicast engine of one view. See the [module docs](self).
pub(crate) struct MulticastEngine<F: Fabric, T: BlockTransport> {
    vid: ViewId,
    table: Arc<SharedStateTable<F>>,
    predicates: Arc<Predicates<F>>,
    transport: Mutex<T>,
    window_size: WindowSize,
    max_payload: PayloadSize,
    max_inline_payload: PayloadSize,
    null_send_timeout: Duration,
    subgroups: HashMap<SubgroupId, SubgroupMeta>,
    send_states: Arc<HashMap<SubgroupId, Mutex<SendState>>>,
    receive_states: HashMap<SubgroupId, Arc<Mutex<ReceiveState>>>,
    wedged: Arc<AtomicBool>,
    registered_predicates: Vec<PredicateHandle>,
    delivery_core: Arc<DeliveryCore<F>>,
    delivery_sender: Sender<DeliveryJob>,
    delivery_thread: Mutex<Option<JoinHandle<()>>>,
    delivery_shutdown: Sender<()>,
    transport_thread: Mutex<Option<JoinHandle<()>>>,
    transport_shutdown: Sender<()>,
    event_publisher: Option<Sender<Event>>,
}

impl<F: Fabric, T: BlockTransport> MulticastEngine<F, T> {
    /// Build the engine for `view`, register its predicates, and start its delivery and transport
    /// poller threads.
    pub(crate) fn start(
        view: &View,
        table: Arc<SharedStateTable<F>>,
        predicates: Arc<Predicates<F>>,
        transport: T,
        config: &MulticastConfig,
        delivery: DeliveryCallback,
        persistence: Option<PersistenceCallback>,
        event_publisher: Option<Sender<Event>>,
    ) -> Arc<Self> {
        let geometry = table.layout().geometry().clone();
        let my_id = view.member_at(view.my_rank);

        let mut subgroups = HashMap::new();
        let mut send_states = HashMap::new();
        let mut receive_states = HashMap::new();
        for (subgroup, shard_index) in &view.my_subgroups {
            let shard = &view.subgroup_shard_views[subgroup.index()][*shard_index];
            let member_view_ranks: Vec<usize> = shard
                .members
                .iter()
                .map(|m| view.rank_of(*m).expect("Shard member is not in the view"))
                .collect();
            let sender_view_ranks: Vec<usize> = shard
                .members
                .iter()
                .enumerate()
                .filter(|(shard_rank, _)| shard.is_sender[*shard_rank])
                .map(|(_, m)| view.rank_of(*m).unwrap())
                .collect();
            let other_members: Vec<NodeId> = shard
                .members
                .iter()
                .copied()
                .filter(|m| *m != my_id)
                .collect();
            let num_senders = shard.num_senders();
            let my_sender_rank = shard
                .my_rank
                .and_then(|shard_rank| shard.sender_rank_of(shard_rank));

            let meta = SubgroupMeta {
                subgroup: *subgroup,
                mode: shard.mode,
                member_view_ranks,
                sender_view_ranks,
                other_members,
                num_senders,
                my_sender_rank,
                slot_base: geometry.sender_slot_base(*subgroup, *shard_index),
            };
            subgroups.insert(*subgroup, meta);
            send_states.insert(
                *subgroup,
                Mutex::new(SendState {
                    next_index: 0,
                    last_send: Instant::now(),
                }),
            );
            receive_states.insert(
                *subgroup,
                Arc::new(Mutex::new(ReceiveState {
                    expected: vec![0; num_senders],
                    rings: (0..num_senders).map(|_| VecDeque::new()).collect(),
                    pending_blocks: (0..num_senders).map(|_| BTreeMap::new()).collect(),
                })),
            );
        }

        let delivery_core = Arc::new(DeliveryCore {
            vid: view.vid,
            table: table.clone(),
            num_senders: subgroups
                .iter()
                .map(|(id, meta)| (*id, meta.num_senders))
                .collect(),
            receive_states: receive_states.clone(),
            callbacks: Mutex::new(Callbacks {
                delivery,
                persistence,
            }),
            event_publisher: event_publisher.clone(),
        });

        let (delivery_sender, delivery_jobs) = mpsc::channel();
        let (delivery_shutdown, delivery_shutdown_receiver) = mpsc::channel();
        let delivery_thread = start_delivery_thread(
            delivery_core.clone(),
            delivery_jobs,
            delivery_shutdown_receiver,
        );

        let raw_subgroups: Vec<SubgroupId> = subgroups
            .values()
            .filter(|meta| meta.mode == Mode::Raw)
            .map(|meta| meta.subgroup)
            .collect();
        let incoming_blocks = Arc::new(Mutex::new(VecDeque::new()));
        let (transport_shutdown, transport_shutdown_receiver) = mpsc::channel();
        let transport_thread = start_transport_poller(
            transport.clone(),
            incoming_blocks.clone(),
            raw_subgroups,
            delivery_sender.clone(),
            transport_shutdown_receiver,
        );

        let mut engine = Self {
            vid: view.vid,
            table,
            predicates,
            transport: Mutex::new(transport),
            window_size: config.window_size,
            max_payload: config.max_payload_size,
            max_inline_payload: config.max_inline_payload_size,
            null_send_timeout: config.null_send_timeout,
            subgroups,
            send_states: Arc::new(send_states),
            receive_states,
            wedged: Arc::new(AtomicBool::new(false)),
            registered_predicates: Vec::new(),
            delivery_core,
            delivery_sender,
            delivery_thread: Mutex::new(Some(delivery_thread)),
            delivery_shutdown,
            transport_thread: Mutex::new(Some(transport_thread)),
            transport_shutdown,
            event_publisher,
        };
        engine.register_predicates(view, incoming_blocks);
        Arc::new(engine)
    }

    /// Multicast `payload` in `subgroup`. Blocks while the send window is exhausted; returns
    /// [`SendError::Wedged`] if a view change begins before a window slot frees, in which case
    /// the application re-attempts in the next view.
    pub(crate) fn send(&self, subgroup: SubgroupId, payload: &[u8]) -> Result<(), SendError> {
        let meta = self
            .subgroups
            .get(&subgroup)
            .ok_or(SendError::SubgroupNotMember)?;
        let sender_rank = meta.my_sender_rank.ok_or(SendError::NotASender)?;
        if payload.len() > self.max_payload.index() {
            return Err(SendError::PayloadTooLarge);
        }
        if self.wedged.load(Ordering::Acquire) {
            return Err(SendError::Wedged);
        }

        let mut send_state = self.send_states[&subgroup].lock().unwrap();
        let index = send_state.next_index;
        let window = self.window_size.index() as i64;

        if meta.mode != Mode::Raw {
            // Window back-pressure: slot `index mod W` is reusable only once the message that last
            // used it is globally stable, i.e. every member has copied it out.
            while index >= window
                && meta.global_num(sender_rank, index - window)
                    > self.table.my_row().stable_num(subgroup).int()
            {
                if self.wedged.load(Ordering::Acquire) {
                    return Err(SendError::Wedged);
                }
                thread::sleep(Duration::from_micros(50));
            }
            if self.wedged.load(Ordering::Acquire) {
                return Err(SendError::Wedged);
            }
        }

        let inline = meta.mode != Mode::Raw && payload.len() <= self.max_inline_payload.index();
        if inline {
            let window_index = (index % window) as usize;
            self.table
                .my_row()
                .write_slot(subgroup, window_index, index, payload);
            self.table
                .put_range(self.table.layout().slot(subgroup, window_index));
        } else {
            // Sequenced block payloads carry their per-sender index, so receivers can merge the
            // block path with the inline path in one index order. Raw payloads go unframed.
            let framed;
            let wire_payload: &[u8] = if meta.mode == Mode::Raw {
                payload
            } else {
                framed = frame_block(index, payload);
                &framed
            };
            let send_result = self.transport.lock().unwrap().send(
                subgroup,
                &meta.other_members,
                wire_payload,
            );
            if let Err(super::transport::TransportError::Unreachable(peer)) = send_result {
                log::warn!("block send to node {} failed; marking row unreachable", peer);
                if let Some(rank) = self.table.rank_of(peer) {
                    self.table.mark_unreachable(rank);
                }
            }
        }

        if meta.mode == Mode::Raw {
            // Raw mode bypasses the counters entirely; loop the local copy straight up.
            let _ = self.delivery_sender.send(DeliveryJob::Raw {
                subgroup,
                payload: payload.to_vec(),
            });
        } else {
            // The sender counts its own message as received: slot first, counter last.
            self.receive_states[&subgroup].lock().unwrap().rings[sender_rank]
                .push_back(Some(payload.to_vec()));
            let slot = meta.slot_base + sender_rank;
            let row = self.table.my_row();
            row.set_num_received(slot, row.num_received(slot) + 1);
            self.table.put_word(self.table.layout().num_received(slot));
        }

        send_state.last_send = Instant::now();
        send_state.next_index = index + 1;
        Ok(())
    }

    /// Refuse new sends, drain in-flight ones, and report this row as wedged. Idempotent.
    pub(crate) fn wedge(&self) {
        if self.wedged.swap(true, Ordering::AcqRel) {
            return;
        }
        // In-flight sends hold their subgroup's send lock; taking each lock drains them.
        for send_state in self.send_states.values() {
            drop(send_state.lock().unwrap());
        }
        let row = self.table.my_row();
        row.set_wedged(true);
        self.table.put_word(self.table.layout().wedged());
        Event::Wedge(WedgeEvent {
            timestamp: SystemTime::now(),
            vid: self.vid,
        })
        .publish(&self.event_publisher);
    }

    pub(crate) fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    /// Stop the delivery thread and wait for it, so ragged-edge delivery can run exclusively on
    /// the caller's thread.
    pub(crate) fn quiesce_delivery(&self) {
        let handle = self.delivery_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.delivery_shutdown.send(());
            let _ = handle.join();
        }
    }

    /// Ragged-edge delivery for one subgroup. Must be called after [`quiesce_delivery`]
    /// (Self::quiesce_delivery).
    pub(crate) fn deliver_ragged_edge(&self, subgroup: SubgroupId, global_min: &[i64]) {
        self.delivery_core.deliver_ragged(subgroup, global_min);
    }

    /// Deregister predicates and stop the engine's threads. The engine is unusable afterwards;
    /// the caller drops it and builds its successor for the next view.
    pub(crate) fn shutdown(&self) {
        for handle in &self.registered_predicates {
            self.predicates.deregister(*handle);
        }
        self.quiesce_delivery();
        let handle = self.transport_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.transport_shutdown.send(());
            let _ = handle.join();
        }
    }

    /// Register the receive/sequence predicate and the stability predicate.
    fn register_predicates(
        &mut self,
        view: &View,
        incoming_blocks: Arc<Mutex<VecDeque<BlockMessage>>>,
    ) {
        let my_rank = view.my_rank;

        // Receive predicate: fires when any sender's row shows the next expected inline slot, or
        // when the transport poller queued a block. Its action drains everything available,
        // advances `num_received`/`num_received_sst`, and recomputes `seq_num`.
        let metas: Vec<SubgroupMeta> = self.subgroups.values().cloned().collect();
        let receive_states = self.receive_states.clone();
        let predicate = {
            let metas = metas.clone();
            let receive_states = receive_states.clone();
            let blocks = incoming_blocks.clone();
            Box::new(move |table: &SharedStateTable<F>| {
                if !blocks.lock().unwrap().is_empty() {
                    return true;
                }
                for meta in &metas {
                    // The local node's own sends advance `num_received` without any slot
                    // arriving, so an unpublished sequence advance also counts as work.
                    if computed_seq(table, my_rank, meta)
                        > table.row(my_rank).seq_num(meta.subgroup).int()
                    {
                        return true;
                    }
                    let state = receive_states[&meta.subgroup].lock().unwrap();
                    for (k, sender_view_rank) in meta.sender_view_ranks.iter().enumerate() {
                        if *sender_view_rank == my_rank {
                            continue;
                        }
                        let expected = state.expected[k];
                        let window_index =
                            (expected % table.layout().geometry().window_size.index() as i64)
                                as usize;
                        if table.row(*sender_view_rank).slot_index(meta.subgroup, window_index)
                            == Some(expected)
                        {
                            return true;
                        }
                    }
                }
                false
            })
        };

        let delivery_sender = self.delivery_sender.clone();
        let node_dense_ranks: HashMap<(SubgroupId, NodeId), usize> = {
            let mut map = HashMap::new();
            for meta in &metas {
                for (k, sender_view_rank) in meta.sender_view_ranks.iter().enumerate() {
                    map.insert((meta.subgroup, view.member_at(*sender_view_rank)), k);
                }
            }
            map
        };
        let action = {
            let metas = metas.clone();
            let receive_states = receive_states.clone();
            let delivery_sender = delivery_sender.clone();
            let blocks = incoming_blocks.clone();
            let send_states = self.send_states.clone();
            let wedged = self.wedged.clone();
            let null_send_timeout = self.null_send_timeout;
            Box::new(move |table: &SharedStateTable<F>| {
                // Stage queued blocks by their framed per-sender index, so the merge below can
                // consume blocks and inline slots in one index order.
                let drained: Vec<BlockMessage> = {
                    let mut blocks = blocks.lock().unwrap();
                    blocks.drain(..).collect()
                };
                for block in drained {
                    let Some(k) = node_dense_ranks.get(&(block.subgroup, block.sender)) else {
                        continue;
                    };
                    let Some((index, payload)) = unframe_block(&block.payload) else {
                        continue;
                    };
                    receive_states[&block.subgroup]
                        .lock()
                        .unwrap()
                        .pending_blocks[*k]
                        .insert(index, payload);
                }

                let window = table.layout().geometry().window_size.index() as i64;
                for meta in &metas {
                    let mut progressed = false;
                    // Consume each sender's messages strictly in index order, taking whichever
                    // path (inline slot or staged block) holds the next expected index.
                    loop {
                        let mut any = false;
                        for (k, sender_view_rank) in meta.sender_view_ranks.iter().enumerate() {
                            if *sender_view_rank == my_rank {
                                continue;
                            }
                            let expected =
                                receive_states[&meta.subgroup].lock().unwrap().expected[k];
                            let window_index = (expected % window) as usize;
                            let sender_row = table.row(*sender_view_rank);

                            let (entry, via_slot) = if sender_row
                                .slot_index(meta.subgroup, window_index)
                                == Some(expected)
                            {
                                let entry = if sender_row.slot_is_null(meta.subgroup, window_index)
                                {
                                    None
                                } else {
                                    Some(sender_row.read_slot(meta.subgroup, window_index))
                                };
                                (entry, true)
                            } else {
                                let staged = receive_states[&meta.subgroup]
                                    .lock()
                                    .unwrap()
                                    .pending_blocks[k]
                                    .remove(&expected);
                                match staged {
                                    Some(payload) => (Some(payload), false),
                                    None => continue,
                                }
                            };

                            {
                                let mut state = receive_states[&meta.subgroup].lock().unwrap();
                                state.rings[k].push_back(entry);
                                state.expected[k] = expected + 1;
                            }
                            let slot = meta.slot_base + k;
                            let row = table.row(my_rank);
                            row.set_num_received(slot, row.num_received(slot) + 1);
                            table.put_word(table.layout().num_received(slot));
                            if via_slot {
                                row.set_num_received_sst(slot, expected + 1);
                                table.put_word(table.layout().num_received_sst(slot));
                            }
                            any = true;
                            progressed = true;
                        }
                        if !any {
                            break;
                        }
                    }

                    // If the rotation has moved past us while we had nothing to send for longer
                    // than the null timeout, emit null messages so the prefix can complete.
                    // Best-effort: an in-flight application send is already feeding the
                    // rotation, so a held lock means skip.
                    if let Some(k_me) = meta.my_sender_rank {
                        if !wedged.load(Ordering::Acquire) {
                            if let Ok(mut send_state) = send_states[&meta.subgroup].try_lock() {
                                let row = table.row(my_rank);
                                let my_slot = meta.slot_base + k_me;
                                let max_received = (0..meta.num_senders)
                                    .map(|k| row.num_received(meta.slot_base + k))
                                    .max()
                                    .unwrap_or(0);
                                while send_state.last_send.elapsed() >= null_send_timeout
                                    && row.num_received(my_slot) < max_received
                                {
                                    let index = send_state.next_index;
                                    if index >= window
                                        && meta.global_num(k_me, index - window)
                                            > row.stable_num(meta.subgroup).int()
                                    {
                                        break;
                                    }
                                    let window_index = (index % window) as usize;
                                    row.write_null_slot(meta.subgroup, window_index, index);
                                    table.put_range(
                                        table.layout().slot(meta.subgroup, window_index),
                                    );
                                    receive_states[&meta.subgroup].lock().unwrap().rings[k_me]
                                        .push_back(None);
                                    row.set_num_received(my_slot, row.num_received(my_slot) + 1);
                                    table.put_word(table.layout().num_received(my_slot));
                                    send_state.next_index = index + 1;
                                }
                            }
                        }
                    }

                    // Recompute the contiguous-prefix sequence number from the receive counts.
                    let row = table.row(my_rank);
                    let seq = computed_seq(table, my_rank, meta);
                    if seq > row.seq_num(meta.subgroup).int() {
                        row.set_seq_num(meta.subgroup, SequenceNumber::new(seq));
                        table.put_word(table.layout().seq_num(meta.subgroup));
                        progressed = true;
                        if meta.mode == Mode::Unordered {
                            let _ = delivery_sender.send(DeliveryJob::Through {
                                subgroup: meta.subgroup,
                                upto: seq,
                            });
                        }
                    }

                    if progressed {
                        row.set_local_stability_frontier(meta.subgroup, now_millis());
                        table.put_word(
                            table.layout().local_stability_frontier(meta.subgroup),
                        );
                    }
                }
            })
        };
        let receive_handle =
            self.predicates
                .register(predicate, action, PredicateMode::Recurring);

        // Stability predicate: fires whenever any row's seq_num admits a higher minimum, and
        // advances `stable_num` and the ordered shards' delivery frontier.
        let failed = view.failed.clone();
        let stability_predicate = {
            let metas = metas.clone();
            let failed = failed.clone();
            Box::new(move |table: &SharedStateTable<F>| {
                metas.iter().any(|meta| {
                    let min = shard_min_seq(table, meta, &failed);
                    min > table.row(my_rank).stable_num(meta.subgroup).int()
                })
            })
        };
        let stability_action = {
            let metas = metas.clone();
            Box::new(move |table: &SharedStateTable<F>| {
                for meta in &metas {
                    let min = shard_min_seq(table, meta, &failed);
                    let row = table.row(my_rank);
                    if min > row.stable_num(meta.subgroup).int() {
                        row.set_stable_num(meta.subgroup, SequenceNumber::new(min));
                        table.put_word(table.layout().stable_num(meta.subgroup));
                        if meta.mode == Mode::Ordered {
                            let _ = delivery_sender.send(DeliveryJob::Through {
                                subgroup: meta.subgroup,
                                upto: min,
                            });
                        }
                    }
                }
            })
        };
        let stability_handle = self.predicates.register(
            stability_predicate,
            stability_action,
            PredicateMode::Recurring,
        );

        self.registered_predicates = vec![receive_handle, stability_handle];
    }
}

/// Prefix a sequenced block payload with its little-endian per-sender index.
fn frame_block(index: i64, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.extend_from_slice(&index.to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Split a framed block back into its per-sender index and payload.
fn unframe_block(framed: &[u8]) -> Option<(i64, Vec<u8>)> {
    if framed.len() < 8 {
        return None;
    }
    let index = i64::from_le_bytes(framed[..8].try_into().unwrap());
    Some((index, framed[8..].to_vec()))
}

/// The highest global sequence number whose entire round-robin prefix the local node has
/// received, computed from its own `num_received` counts: `min over k of (S·n_k + k) − 1`.
fn computed_seq<F: Fabric>(table: &SharedStateTable<F>, my_rank: usize, meta: &SubgroupMeta) -> i64 {
    let row = table.row(my_rank);
    (0..meta.num_senders)
        .map(|k| meta.num_senders as i64 * row.num_received(meta.slot_base + k) + k as i64)
        .min()
        .unwrap_or(0)
        - 1
}

/// Minimum `seq_num` across the shard's non-failed members, as observed locally.
fn shard_min_seq<F: Fabric>(
    table: &SharedStateTable<F>,
    meta: &SubgroupMeta,
    failed: &[bool],
) -> i64 {
    meta.member_view_ranks
        .iter()
        .filter(|rank| !failed[**rank])
        .map(|rank| table.row(*rank).seq_num(meta.subgroup).int())
        .min()
        .unwrap_or(SequenceNumber::init().int())
}

/// The delivery thread: executes delivery jobs in the order the predicates admitted them. Upcalls
/// are blocking; the next message in order waits for the previous upcall to return.
fn start_delivery_thread<F: Fabric>(
    core: Arc<DeliveryCore<F>>,
    jobs: Receiver<DeliveryJob>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }

        match jobs.recv_timeout(Duration::from_millis(1)) {
            Ok(DeliveryJob::Through { subgroup, upto }) => core.deliver_through(subgroup, upto),
            Ok(DeliveryJob::Raw { subgroup, payload }) => core.deliver_raw(subgroup, &payload),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// The transport poller: drains the block transport and hands payloads to the receive predicate
/// (ordered/unordered shards) or directly to the delivery thread (raw shards).
fn start_transport_poller<T: BlockTransport>(
    mut transport: T,
    incoming_blocks: Arc<Mutex<VecDeque<BlockMessage>>>,
    raw_subgroups: Vec<SubgroupId>,
    delivery_sender: Sender<DeliveryJob>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }

        if let Some(block) = transport.recv() {
            if raw_subgroups.contains(&block.subgroup) {
                let _ = delivery_sender.send(DeliveryJob::Raw {
                    subgroup: block.subgroup,
                    payload: block.payload,
                });
            } else {
                incoming_blocks.lock().unwrap().push_back(block);
            }
        } else {
            thread::yield_now()
        }
    })
}
