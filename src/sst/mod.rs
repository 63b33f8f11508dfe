/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Shared State Table: a replicated table of fixed-width rows, one row per view member,
//! exchanged by one-sided remote writes.
//!
//! Each member writes only its own row and reads all rows. The table is the sole coordination
//! channel of the membership and multicast protocols: everything they exchange is a monotone
//! counter or a flag in some row.
//!
//! ## Memory model
//!
//! Rows are arrays of 64-bit words held in `AtomicI64`s. The owner writes its row with `Release`
//! stores; readers use `Acquire` loads; updates arriving from the fabric are applied with
//! `Release` stores by the [poller thread](fabric::start_fabric_poller). Torn multi-word reads
//! are tolerated by the protocols because every field that matters is either a single word or a
//! monotone counter guarded by a companion flag that is published strictly later.
//!
//! A table exists for exactly one view. Its successor is initialized from it and replaces it
//! wholesale at view install.

pub mod fabric;

pub mod layout;

pub mod predicates;

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Mutex,
};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{
    data_types::{NodeId, SequenceNumber, SubgroupId, ViewId},
    node::NodeAddress,
};

use self::{
    fabric::{Fabric, RowUpdate},
    layout::{RowLayout, WordRange},
};

/// The replicated row-per-member word table. See the [module docs](self).
pub struct SharedStateTable<F: Fabric> {
    vid: ViewId,
    layout: RowLayout,
    members: Vec<NodeId>,
    my_rank: usize,
    rows: Vec<Box<[AtomicI64]>>,
    unreachable: Vec<AtomicBool>,
    fabric: Mutex<F>,
}

impl<F: Fabric> SharedStateTable<F> {
    /// Create a table for the view identified by `vid`, with all counters zeroed and all flags
    /// cleared.
    ///
    /// `local_stability_frontier` starts at the current wall-clock time in every row, so a member
    /// that never makes progress is eventually suspected rather than trusted forever.
    pub fn new(
        vid: ViewId,
        layout: RowLayout,
        members: Vec<NodeId>,
        my_rank: usize,
        fabric: F,
    ) -> Self {
        let num_members = members.len();
        let row_words = layout.row_words();
        let rows: Vec<Box<[AtomicI64]>> = (0..num_members)
            .map(|_| (0..row_words).map(|_| AtomicI64::new(0)).collect())
            .collect();

        let table = Self {
            vid,
            layout,
            members,
            my_rank,
            rows,
            unreachable: (0..num_members).map(|_| AtomicBool::new(false)).collect(),
            fabric: Mutex::new(fabric),
        };
        table.my_row().set_vid(vid);

        let now = now_millis();
        for rank in 0..num_members {
            let row = table.row(rank);
            for subgroup in 0..table.layout.geometry().num_subgroups {
                let subgroup = SubgroupId::new(subgroup as u32);
                // Sequence counters start at "nothing received yet", never at a real sequence
                // number, so a row whose owner has not published cannot admit a delivery.
                row.set_seq_num(subgroup, SequenceNumber::init());
                row.set_stable_num(subgroup, SequenceNumber::init());
                row.set_delivered_num(subgroup, SequenceNumber::init());
                row.set_persisted_num(subgroup, SequenceNumber::init());
                row.set_local_stability_frontier(subgroup, now);
            }
        }
        table
    }

    /// The view this table belongs to.
    pub fn vid(&self) -> ViewId {
        self.vid
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn rank_of(&self, who: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == who)
    }

    /// A zero-copy handle onto row `rank`. Reads are unsynchronized across fields.
    pub fn row(&self, rank: usize) -> RowHandle<'_> {
        RowHandle {
            words: &self.rows[rank],
            layout: &self.layout,
        }
    }

    /// The local node's own row, the only one this node may write.
    pub fn my_row(&self) -> RowHandle<'_> {
        self.row(self.my_rank)
    }

    /// Publish a contiguous range of the local row to every other member.
    ///
    /// Completion signals that the words left the local buffer; peers observe them by polling.
    /// A peer whose row replica cannot be written is marked unreachable, which the membership
    /// protocol treats as a failure suspicion.
    pub fn put_range(&self, range: WordRange) {
        let words: Vec<i64> = (range.start..range.end())
            .map(|w| self.rows[self.my_rank][w].load(Ordering::Acquire))
            .collect();

        let mut fabric = self.fabric.lock().unwrap();
        for (rank, peer) in self.members.iter().enumerate() {
            if rank == self.my_rank || self.is_unreachable(rank) {
                continue;
            }
            if fabric.write(*peer, self.vid, range.start, &words).is_err() {
                log::warn!("state table write to node {} failed; marking row unreachable", peer);
                self.mark_unreachable(rank);
            }
        }
    }

    /// Publish a single word of the local row.
    pub fn put_word(&self, word: usize) {
        self.put_range(WordRange::single(word))
    }

    /// Publish the whole local row.
    pub fn put_all(&self) {
        self.put_range(WordRange::new(0, self.layout.row_words()))
    }

    /// Apply a word-range update received from a peer's row. Updates addressed to another view's
    /// table, or from nodes outside this table's view, are dropped.
    pub fn apply_update(&self, update: &RowUpdate) {
        if update.vid != self.vid {
            return;
        }
        let Some(rank) = self.rank_of(update.origin) else {
            return;
        };
        if rank == self.my_rank {
            return;
        }
        let row = &self.rows[rank];
        if update.offset + update.words.len() > row.len() {
            return;
        }
        for (i, word) in update.words.iter().enumerate() {
            row[update.offset + i].store(*word, Ordering::Release);
        }
    }

    pub fn mark_unreachable(&self, rank: usize) {
        self.unreachable[rank].store(true, Ordering::Release);
    }

    /// Whether row `rank`'s owner could not be written. The predicate layer treats an unreachable
    /// row as a suspected member.
    pub fn is_unreachable(&self, rank: usize) -> bool {
        self.unreachable[rank].load(Ordering::Acquire)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is set before the Unix epoch")
        .as_millis() as i64
}

/// A typed view of one row. Setters must only be used on the local node's own row.
#[derive(Clone, Copy)]
pub struct RowHandle<'a> {
    words: &'a [AtomicI64],
    layout: &'a RowLayout,
}

impl<'a> RowHandle<'a> {
    fn load(&self, word: usize) -> i64 {
        self.words[word].load(Ordering::Acquire)
    }

    fn store(&self, word: usize, value: i64) {
        self.words[word].store(value, Ordering::Release)
    }

    /// Copy a word range from another row into this one. Used when a member adopts a peer's
    /// proposal log wholesale.
    pub(crate) fn copy_from(&self, other: &RowHandle<'_>, range: WordRange) {
        for word in range.start..range.end() {
            self.store(word, other.load(word));
        }
    }

    pub fn seq_num(&self, subgroup: SubgroupId) -> SequenceNumber {
        SequenceNumber::new(self.load(self.layout.seq_num(subgroup)))
    }

    pub fn set_seq_num(&self, subgroup: SubgroupId, value: SequenceNumber) {
        self.store(self.layout.seq_num(subgroup), value.int())
    }

    pub fn stable_num(&self, subgroup: SubgroupId) -> SequenceNumber {
        SequenceNumber::new(self.load(self.layout.stable_num(subgroup)))
    }

    pub fn set_stable_num(&self, subgroup: SubgroupId, value: SequenceNumber) {
        self.store(self.layout.stable_num(subgroup), value.int())
    }

    pub fn delivered_num(&self, subgroup: SubgroupId) -> SequenceNumber {
        SequenceNumber::new(self.load(self.layout.delivered_num(subgroup)))
    }

    pub fn set_delivered_num(&self, subgroup: SubgroupId, value: SequenceNumber) {
        self.store(self.layout.delivered_num(subgroup), value.int())
    }

    pub fn persisted_num(&self, subgroup: SubgroupId) -> SequenceNumber {
        SequenceNumber::new(self.load(self.layout.persisted_num(subgroup)))
    }

    pub fn set_persisted_num(&self, subgroup: SubgroupId, value: SequenceNumber) {
        self.store(self.layout.persisted_num(subgroup), value.int())
    }

    pub fn vid(&self) -> ViewId {
        ViewId::new(self.load(self.layout.vid()) as i32)
    }

    pub fn set_vid(&self, vid: ViewId) {
        self.store(self.layout.vid(), vid.int() as i64)
    }

    pub fn suspected(&self, rank: usize) -> bool {
        self.load(self.layout.suspected(rank)) != 0
    }

    pub fn set_suspected(&self, rank: usize, value: bool) {
        self.store(self.layout.suspected(rank), value as i64)
    }

    /// The node named in change-log slot `index mod capacity`.
    pub fn change(&self, index: i64) -> NodeId {
        NodeId::new(self.load(self.layout.change(index)) as u32)
    }

    pub fn set_change(&self, index: i64, change: NodeId) {
        self.store(self.layout.change(index), change.int() as i64)
    }

    /// The packed address parallel to change-log slot `index`, meaningful only for join entries.
    pub fn joiner_ip(&self, index: i64) -> NodeAddress {
        let range = self.layout.joiner_ip(index);
        NodeAddress::unpack([self.load(range.start), self.load(range.start + 1)])
    }

    pub fn set_joiner_ip(&self, index: i64, address: NodeAddress) {
        let range = self.layout.joiner_ip(index);
        let words = address.pack();
        self.store(range.start, words[0]);
        self.store(range.start + 1, words[1]);
    }

    pub fn num_changes(&self) -> i64 {
        self.load(self.layout.num_changes())
    }

    pub fn set_num_changes(&self, value: i64) {
        self.store(self.layout.num_changes(), value)
    }

    pub fn num_committed(&self) -> i64 {
        self.load(self.layout.num_committed())
    }

    pub fn set_num_committed(&self, value: i64) {
        self.store(self.layout.num_committed(), value)
    }

    pub fn num_acked(&self) -> i64 {
        self.load(self.layout.num_acked())
    }

    pub fn set_num_acked(&self, value: i64) {
        self.store(self.layout.num_acked(), value)
    }

    pub fn num_installed(&self) -> i64 {
        self.load(self.layout.num_installed())
    }

    pub fn set_num_installed(&self, value: i64) {
        self.store(self.layout.num_installed(), value)
    }

    pub fn num_received(&self, sender_slot: usize) -> i64 {
        self.load(self.layout.num_received(sender_slot))
    }

    pub fn set_num_received(&self, sender_slot: usize, value: i64) {
        self.store(self.layout.num_received(sender_slot), value)
    }

    pub fn wedged(&self) -> bool {
        self.load(self.layout.wedged()) != 0
    }

    pub fn set_wedged(&self, value: bool) {
        self.store(self.layout.wedged(), value as i64)
    }

    pub fn global_min(&self, sender_slot: usize) -> i64 {
        self.load(self.layout.global_min(sender_slot))
    }

    pub fn set_global_min(&self, sender_slot: usize, value: i64) {
        self.store(self.layout.global_min(sender_slot), value)
    }

    pub fn global_min_ready(&self, subgroup: SubgroupId) -> bool {
        self.load(self.layout.global_min_ready(subgroup)) != 0
    }

    pub fn set_global_min_ready(&self, subgroup: SubgroupId, value: bool) {
        self.store(self.layout.global_min_ready(subgroup), value as i64)
    }

    /// The per-sender message index stored in the header of the given inline slot, or `None` if
    /// the slot has never been written.
    pub fn slot_index(&self, subgroup: SubgroupId, window_index: usize) -> Option<i64> {
        let header = self.load(self.layout.slot(subgroup, window_index).start);
        if header == 0 {
            None
        } else {
            Some((header >> 25) - 1)
        }
    }

    /// Whether the given slot holds a null message: an index-occupying filler a sender emits to
    /// keep the round-robin rotation moving while it has nothing to say. Nulls are sequenced but
    /// never delivered upward.
    pub fn slot_is_null(&self, subgroup: SubgroupId, window_index: usize) -> bool {
        let header = self.load(self.layout.slot(subgroup, window_index).start);
        header & (1 << 24) != 0
    }

    /// Write an inline message into the slot: payload words first, header word strictly last, so
    /// that a reader that observes the header observes the payload.
    pub fn write_slot(&self, subgroup: SubgroupId, window_index: usize, index: i64, payload: &[u8]) {
        let range = self.layout.slot(subgroup, window_index);
        for (i, chunk) in payload.chunks(8).enumerate() {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.store(range.start + 1 + i, i64::from_le_bytes(bytes));
        }
        let header = ((index + 1) << 25) | payload.len() as i64;
        self.store(range.start, header);
    }

    /// Write a null message into the slot: a header with the null bit and no payload.
    pub fn write_null_slot(&self, subgroup: SubgroupId, window_index: usize, index: i64) {
        let range = self.layout.slot(subgroup, window_index);
        let header = ((index + 1) << 25) | (1 << 24);
        self.store(range.start, header);
    }

    /// Copy the payload bytes out of the given inline slot.
    pub fn read_slot(&self, subgroup: SubgroupId, window_index: usize) -> Vec<u8> {
        let range = self.layout.slot(subgroup, window_index);
        let len = (self.load(range.start) & 0xff_ffff) as usize;
        let mut payload = Vec::with_capacity(len);
        let mut word_index = range.start + 1;
        while payload.len() < len {
            let bytes = self.load(word_index).to_le_bytes();
            let take = (len - payload.len()).min(8);
            payload.extend_from_slice(&bytes[..take]);
            word_index += 1;
        }
        payload
    }

    pub fn num_received_sst(&self, sender_slot: usize) -> i64 {
        self.load(self.layout.num_received_sst(sender_slot))
    }

    pub fn set_num_received_sst(&self, sender_slot: usize, value: i64) {
        self.store(self.layout.num_received_sst(sender_slot), value)
    }

    /// Wall-clock milliseconds of the last observed progress in `subgroup` at this row.
    pub fn local_stability_frontier(&self, subgroup: SubgroupId) -> i64 {
        self.load(self.layout.local_stability_frontier(subgroup))
    }

    pub fn set_local_stability_frontier(&self, subgroup: SubgroupId, millis: i64) {
        self.store(self.layout.local_stability_frontier(subgroup), millis)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::data_types::{PayloadSize, WindowSize};

    use super::layout::SstGeometry;
    use super::*;

    use fabric::NullFabric;

    fn small_table() -> SharedStateTable<NullFabric> {
        let geometry = SstGeometry {
            num_members: 2,
            num_subgroups: 1,
            sender_slots: 2,
            changes_capacity: 4,
            max_inline_payload: PayloadSize::new(24),
            window_size: WindowSize::new(4),
            sender_slot_bases: vec![vec![0]],
        };
        SharedStateTable::new(
            ViewId::init(),
            RowLayout::new(geometry),
            vec![NodeId::new(0), NodeId::new(1)],
            0,
            NullFabric,
        )
    }

    #[test]
    fn slot_round_trip() {
        let table = small_table();
        let row = table.my_row();
        let subgroup = SubgroupId::new(0);
        assert_eq!(row.slot_index(subgroup, 2), None);

        row.write_slot(subgroup, 2, 0, b"hello world");
        assert_eq!(row.slot_index(subgroup, 2), Some(0));
        assert!(!row.slot_is_null(subgroup, 2));
        assert_eq!(row.read_slot(subgroup, 2), b"hello world");

        // Index 0 with an empty payload is still distinguishable from an untouched slot.
        row.write_slot(subgroup, 3, 0, b"");
        assert_eq!(row.slot_index(subgroup, 3), Some(0));
        assert_eq!(row.read_slot(subgroup, 3), b"");

        // Nulls occupy an index but carry nothing.
        row.write_null_slot(subgroup, 1, 4);
        assert_eq!(row.slot_index(subgroup, 1), Some(4));
        assert!(row.slot_is_null(subgroup, 1));
        assert_eq!(row.read_slot(subgroup, 1), b"");
    }

    #[test]
    fn updates_from_unknown_origins_or_views_are_dropped() {
        let table = small_table();
        table.apply_update(&RowUpdate {
            origin: NodeId::new(42),
            vid: ViewId::init(),
            offset: 0,
            words: vec![7; 4],
        });
        assert_eq!(table.row(1).seq_num(SubgroupId::new(0)), SequenceNumber::init());

        table.apply_update(&RowUpdate {
            origin: NodeId::new(1),
            vid: ViewId::new(3),
            offset: table.layout().num_changes(),
            words: vec![3],
        });
        assert_eq!(table.row(1).num_changes(), 0);

        table.apply_update(&RowUpdate {
            origin: NodeId::new(1),
            vid: ViewId::init(),
            offset: table.layout().num_changes(),
            words: vec![3],
        });
        assert_eq!(table.row(1).num_changes(), 3);
    }
}
