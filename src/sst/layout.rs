/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Word-level geometry of a state table row.
//!
//! Every field of a row is stored in 64-bit words at offsets computed here from the shape of the
//! view the table belongs to. The field order below is binding: `put` publishes contiguous word
//! ranges, and the protocols rely on data fields being publishable separately from (and strictly
//! before) their companion ready-style flags.
//!
//! Row order: `seq_num[s]`, `stable_num[s]`, `delivered_num[s]`, `persisted_num[s]`, `vid`,
//! `suspected[m]`, `changes[c]`, `joiner_ips[2c]`, `num_changes`, `num_committed`, `num_acked`,
//! `num_installed`, `num_received[k]`, `wedged`, `global_min[k]`, `global_min_ready[s]`,
//! `slots[s·W]`, `num_received_sst[k]`, `local_stability_frontier[s]`.

use crate::types::{
    data_types::{PayloadSize, SubgroupId, WindowSize},
    view::View,
};

/// A contiguous range of words within a row, the unit of publication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordRange {
    pub start: usize,
    pub len: usize,
}

impl WordRange {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub const fn single(start: usize) -> Self {
        Self { start, len: 1 }
    }

    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// The shape parameters a row's layout is computed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SstGeometry {
    /// Number of members of the view (`m`).
    pub num_members: usize,
    /// Number of subgroups in the view's layout (`s`).
    pub num_subgroups: usize,
    /// Total number of sender slots across all subgroup shards (`k`).
    pub sender_slots: usize,
    /// Capacity of the circular membership-change log (`c`).
    pub changes_capacity: usize,
    /// Multicast window size (`W`).
    pub window_size: WindowSize,
    /// Largest payload the inline slot path carries.
    pub max_inline_payload: PayloadSize,
    /// For each subgroup, for each shard, the first sender slot assigned to that shard.
    ///
    /// A shard with dense sender rank `q` uses slot `sender_slot_bases[subgroup][shard] + q` in
    /// `num_received`, `num_received_sst`, and `global_min`. Non-senders own no slot, so the
    /// ragged-edge minimum ranges over senders only, by construction.
    pub sender_slot_bases: Vec<Vec<usize>>,
}

impl SstGeometry {
    /// Compute the geometry for `view`, whose layout must already be installed.
    ///
    /// Every member computes this identically from the shared view, which is what makes the word
    /// offsets agree across the group.
    pub fn for_view(
        view: &View,
        window_size: WindowSize,
        max_inline_payload: PayloadSize,
        changes_capacity: usize,
    ) -> Self {
        let mut sender_slot_bases = Vec::with_capacity(view.subgroup_shard_views.len());
        let mut next_slot = 0;
        for shards in &view.subgroup_shard_views {
            let mut bases = Vec::with_capacity(shards.len());
            for shard in shards {
                bases.push(next_slot);
                next_slot += shard.num_senders();
            }
            sender_slot_bases.push(bases);
        }
        Self {
            num_members: view.num_members(),
            num_subgroups: view.subgroup_shard_views.len(),
            sender_slots: next_slot,
            changes_capacity,
            window_size,
            max_inline_payload,
            sender_slot_bases,
        }
    }

    /// The first sender slot of shard `shard_index` of subgroup `subgroup`.
    pub fn sender_slot_base(&self, subgroup: SubgroupId, shard_index: usize) -> usize {
        self.sender_slot_bases[subgroup.index()][shard_index]
    }

    /// Words in one inline message slot: one header word plus the payload rounded up to words.
    pub fn slot_words(&self) -> usize {
        1 + (self.max_inline_payload.index() + 7) / 8
    }
}

/// Word offsets of every row field, computed once per view from an [`SstGeometry`].
#[derive(Clone, Debug)]
pub struct RowLayout {
    geometry: SstGeometry,
    seq_num: usize,
    stable_num: usize,
    delivered_num: usize,
    persisted_num: usize,
    vid: usize,
    suspected: usize,
    changes: usize,
    joiner_ips: usize,
    num_changes: usize,
    num_committed: usize,
    num_acked: usize,
    num_installed: usize,
    num_received: usize,
    wedged: usize,
    global_min: usize,
    global_min_ready: usize,
    slots: usize,
    num_received_sst: usize,
    local_stability_frontier: usize,
    row_words: usize,
}

impl RowLayout {
    pub fn new(geometry: SstGeometry) -> Self {
        let s = geometry.num_subgroups;
        let m = geometry.num_members;
        let c = geometry.changes_capacity;
        let k = geometry.sender_slots;
        let w = geometry.window_size.index();
        let slot_words = geometry.slot_words();

        let seq_num = 0;
        let stable_num = seq_num + s;
        let delivered_num = stable_num + s;
        let persisted_num = delivered_num + s;
        let vid = persisted_num + s;
        let suspected = vid + 1;
        let changes = suspected + m;
        let joiner_ips = changes + c;
        let num_changes = joiner_ips + 2 * c;
        let num_committed = num_changes + 1;
        let num_acked = num_committed + 1;
        let num_installed = num_acked + 1;
        let num_received = num_installed + 1;
        let wedged = num_received + k;
        let global_min = wedged + 1;
        let global_min_ready = global_min + k;
        let slots = global_min_ready + s;
        let num_received_sst = slots + s * w * slot_words;
        let local_stability_frontier = num_received_sst + k;
        let row_words = local_stability_frontier + s;

        Self {
            geometry,
            seq_num,
            stable_num,
            delivered_num,
            persisted_num,
            vid,
            suspected,
            changes,
            joiner_ips,
            num_changes,
            num_committed,
            num_acked,
            num_installed,
            num_received,
            wedged,
            global_min,
            global_min_ready,
            slots,
            num_received_sst,
            local_stability_frontier,
            row_words,
        }
    }

    pub fn geometry(&self) -> &SstGeometry {
        &self.geometry
    }

    pub fn row_words(&self) -> usize {
        self.row_words
    }

    pub fn seq_num(&self, subgroup: SubgroupId) -> usize {
        self.seq_num + subgroup.index()
    }

    pub fn stable_num(&self, subgroup: SubgroupId) -> usize {
        self.stable_num + subgroup.index()
    }

    pub fn delivered_num(&self, subgroup: SubgroupId) -> usize {
        self.delivered_num + subgroup.index()
    }

    pub fn persisted_num(&self, subgroup: SubgroupId) -> usize {
        self.persisted_num + subgroup.index()
    }

    pub fn vid(&self) -> usize {
        self.vid
    }

    pub fn suspected(&self, rank: usize) -> usize {
        self.suspected + rank
    }

    pub fn suspected_range(&self) -> WordRange {
        WordRange::new(self.suspected, self.geometry.num_members)
    }

    /// Slot `index mod capacity` of the circular change log.
    pub fn change(&self, index: i64) -> usize {
        self.changes + (index.rem_euclid(self.geometry.changes_capacity as i64) as usize)
    }

    pub fn changes_range(&self) -> WordRange {
        WordRange::new(self.changes, self.geometry.changes_capacity)
    }

    /// The two address words parallel to change-log slot `index mod capacity`.
    pub fn joiner_ip(&self, index: i64) -> WordRange {
        let slot = index.rem_euclid(self.geometry.changes_capacity as i64) as usize;
        WordRange::new(self.joiner_ips + 2 * slot, 2)
    }

    pub fn joiner_ips_range(&self) -> WordRange {
        WordRange::new(self.joiner_ips, 2 * self.geometry.changes_capacity)
    }

    pub fn num_changes(&self) -> usize {
        self.num_changes
    }

    pub fn num_committed(&self) -> usize {
        self.num_committed
    }

    pub fn num_acked(&self) -> usize {
        self.num_acked
    }

    pub fn num_installed(&self) -> usize {
        self.num_installed
    }

    pub fn num_received(&self, sender_slot: usize) -> usize {
        self.num_received + sender_slot
    }

    pub fn num_received_range(&self) -> WordRange {
        WordRange::new(self.num_received, self.geometry.sender_slots)
    }

    pub fn wedged(&self) -> usize {
        self.wedged
    }

    pub fn global_min(&self, sender_slot: usize) -> usize {
        self.global_min + sender_slot
    }

    pub fn global_min_range(&self) -> WordRange {
        WordRange::new(self.global_min, self.geometry.sender_slots)
    }

    pub fn global_min_ready(&self, subgroup: SubgroupId) -> usize {
        self.global_min_ready + subgroup.index()
    }

    /// The whole slot (header word plus payload words) of window position `window_index` of
    /// `subgroup`.
    pub fn slot(&self, subgroup: SubgroupId, window_index: usize) -> WordRange {
        let slot_words = self.geometry.slot_words();
        let base = self.slots
            + (subgroup.index() * self.geometry.window_size.index() + window_index) * slot_words;
        WordRange::new(base, slot_words)
    }

    pub fn num_received_sst(&self, sender_slot: usize) -> usize {
        self.num_received_sst + sender_slot
    }

    pub fn local_stability_frontier(&self, subgroup: SubgroupId) -> usize {
        self.local_stability_frontier + subgroup.index()
    }

    pub fn local_stability_frontier_range(&self) -> WordRange {
        WordRange::new(self.local_stability_frontier, self.geometry.num_subgroups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> SstGeometry {
        SstGeometry {
            num_members: 3,
            num_subgroups: 2,
            sender_slots: 5,
            changes_capacity: 8,
            window_size: WindowSize::new(4),
            max_inline_payload: PayloadSize::new(32),
            sender_slot_bases: vec![vec![0], vec![3]],
        }
    }

    #[test]
    fn fields_are_disjoint_and_ordered() {
        let layout = RowLayout::new(geometry());
        // Data fields precede their companion flags.
        assert!(layout.num_received_range().end() <= layout.wedged());
        assert!(layout.global_min_range().end() <= layout.global_min_ready(SubgroupId::new(0)));
        assert!(layout.changes_range().end() <= layout.num_changes());
        // Last field ends exactly at the row boundary.
        assert_eq!(
            layout.local_stability_frontier(SubgroupId::new(1)) + 1,
            layout.row_words()
        );
    }

    #[test]
    fn change_log_wraps_with_modular_arithmetic() {
        let layout = RowLayout::new(geometry());
        assert_eq!(layout.change(0), layout.change(8));
        assert_eq!(layout.change(7) + 1, layout.change(8) + 8);
        assert_eq!(layout.joiner_ip(3), layout.joiner_ip(11));
    }
}
