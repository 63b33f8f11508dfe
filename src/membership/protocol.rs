/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The membership protocol's operations over the state table: change proposal and merge, the
//! acknowledge/commit watermarks, wedge detection, the ragged-edge cutoff, and next-view
//! construction.
//!
//! Everything here is a step function over `(View, SharedStateTable)`: the
//! [manager](super::manager) calls these repeatedly and idempotently as its predicates fire.
//!
//! ## The change log
//!
//! Every row carries a circular log `changes[]` of proposed joins and departures, with three
//! watermarks: `num_changes` (proposed), `num_committed` (agreed by a quorum), and
//! `num_installed` (applied to a view). `num_changes − num_installed` never exceeds the log's
//! capacity. The log with the highest `num_changes` wins a merge: proposal history is
//! append-only, so the longest log extends every shorter one.

use crate::sst::{fabric::Fabric, SharedStateTable};
use crate::types::{
    data_types::{NodeId, SubgroupId},
    node::{Node, NodeAddress},
    view::View,
};

/// Adopt the longest proposal log and highest commit watermark visible in any row, then append a
/// departure entry for every failed member not already listed, and publish.
pub(crate) fn merge_changes<F: Fabric>(view: &View, table: &SharedStateTable<F>) {
    let my_row = table.my_row();
    for n in 0..view.num_members() {
        let row = table.row(n);
        if row.num_changes() > my_row.num_changes() {
            my_row.copy_from(&row, table.layout().changes_range());
            my_row.copy_from(&row, table.layout().joiner_ips_range());
            my_row.set_num_changes(row.num_changes());
        }
        if row.num_committed() > my_row.num_committed() {
            my_row.set_num_committed(row.num_committed());
        }
    }

    let capacity = table.layout().geometry().changes_capacity as i64;
    for n in 0..view.num_members() {
        if !view.failed[n] {
            continue;
        }
        let member = view.members[n];
        let already_listed = (my_row.num_installed()..my_row.num_changes())
            .any(|c| my_row.change(c) == member);
        if already_listed {
            continue;
        }
        if my_row.num_changes() - my_row.num_installed() >= capacity {
            log::warn!(
                "change log is full; deferring the departure proposal for node {}",
                member
            );
            break;
        }
        my_row.set_change(my_row.num_changes(), member);
        my_row.set_num_changes(my_row.num_changes() + 1);
    }

    publish_change_log(table);
}

/// Append a join proposal for `joiner`, if there is log capacity and it is not already pending.
/// Returns whether the proposal was appended.
pub(crate) fn propose_join<F: Fabric>(table: &SharedStateTable<F>, joiner: Node) -> bool {
    let my_row = table.my_row();
    let already_listed =
        (my_row.num_installed()..my_row.num_changes()).any(|c| my_row.change(c) == joiner.id);
    if already_listed {
        return false;
    }
    let capacity = table.layout().geometry().changes_capacity as i64;
    if my_row.num_changes() - my_row.num_installed() >= capacity {
        log::warn!(
            "change log is full; deferring the join proposal for node {}",
            joiner.id
        );
        return false;
    }
    let index = my_row.num_changes();
    my_row.set_change(index, joiner.id);
    my_row.set_joiner_ip(index, joiner.address);
    my_row.set_num_changes(index + 1);
    publish_change_log(table);
    true
}

/// Publish the change log and its watermarks, data strictly before counters: `changes`, then
/// `joiner_ips`, then `num_changes`, then `num_committed`.
pub(crate) fn publish_change_log<F: Fabric>(table: &SharedStateTable<F>) {
    table.put_range(table.layout().changes_range());
    table.put_range(table.layout().joiner_ips_range());
    table.put_word(table.layout().num_changes());
    table.put_word(table.layout().num_committed());
}

/// Adopt any longer log visible (typically the leader's), then acknowledge everything adopted by
/// advancing `num_acked` to `num_changes`. Returns whether the ack watermark moved.
pub(crate) fn acknowledge_changes<F: Fabric>(view: &View, table: &SharedStateTable<F>) -> bool {
    let my_row = table.my_row();
    let mut adopted = false;
    for n in 0..view.num_members() {
        let row = table.row(n);
        if row.num_changes() > my_row.num_changes() {
            my_row.copy_from(&row, table.layout().changes_range());
            my_row.copy_from(&row, table.layout().joiner_ips_range());
            my_row.set_num_changes(row.num_changes());
            adopted = true;
        }
        if row.num_committed() > my_row.num_committed() {
            my_row.set_num_committed(row.num_committed());
            adopted = true;
        }
    }
    if adopted {
        publish_change_log(table);
    }

    if my_row.num_acked() < my_row.num_changes() {
        my_row.set_num_acked(my_row.num_changes());
        table.put_word(table.layout().num_acked());
        return true;
    }
    adopted
}

/// Whether the local node is the leader and, if it inherited leadership, whether its claim is
/// established: every surviving row must already show the suspicion of every lower-ranked
/// member, so no survivor still follows the old leader.
pub(crate) fn i_am_established_leader<F: Fabric>(
    view: &View,
    table: &SharedStateTable<F>,
) -> bool {
    if view.rank_of_leader() != Some(view.my_rank) {
        return false;
    }
    for lower in 0..view.my_rank {
        for observer in 0..view.num_members() {
            if !view.failed[observer] && !table.row(observer).suspected(lower) {
                return false;
            }
        }
    }
    true
}

/// Leader-only: advance `num_committed` to `num_changes` once a quorum (majority of the view,
/// counting only non-failed rows) has acknowledged the full log. Returns the new commit
/// watermark if it moved.
pub(crate) fn try_commit<F: Fabric>(view: &View, table: &SharedStateTable<F>) -> Option<i64> {
    let my_row = table.my_row();
    let num_changes = my_row.num_changes();
    if num_changes <= my_row.num_committed() {
        return None;
    }
    let quorum = view.num_members() / 2 + 1;
    let acks = (0..view.num_members())
        .filter(|rank| !view.failed[*rank])
        .filter(|rank| table.row(*rank).num_acked() >= num_changes)
        .count();
    if acks < quorum {
        return None;
    }
    my_row.set_num_committed(num_changes);
    table.put_word(table.layout().num_committed());
    Some(num_changes)
}

/// Whether some row shows committed-but-uninstalled changes, which obliges every member to wedge.
pub(crate) fn changes_committed<F: Fabric>(view: &View, table: &SharedStateTable<F>) -> bool {
    (0..view.num_members())
        .any(|rank| table.row(rank).num_committed() > table.row(rank).num_installed())
}

/// Whether every surviving member has reported itself wedged.
pub(crate) fn all_survivors_wedged<F: Fabric>(view: &View, table: &SharedStateTable<F>) -> bool {
    (0..view.num_members())
        .filter(|rank| !view.failed[*rank])
        .all(|rank| table.row(rank).wedged())
}

/// Shard-leader only: compute `global_min[k]` for every sender `k` of the shard (the minimum of
/// the survivors' `num_received[k]`), publish the vector, and only then raise the per-subgroup
/// ready flag.
pub(crate) fn publish_global_min<F: Fabric>(
    view: &View,
    table: &SharedStateTable<F>,
    subgroup: SubgroupId,
    shard_index: usize,
) {
    let shard = &view.subgroup_shard_views[subgroup.index()][shard_index];
    let base = table.layout().geometry().sender_slot_base(subgroup, shard_index);
    let my_row = table.my_row();
    for k in 0..shard.num_senders() {
        let min = shard
            .members
            .iter()
            .filter_map(|member| view.rank_of(*member))
            .filter(|rank| !view.failed[*rank])
            .map(|rank| table.row(rank).num_received(base + k))
            .min()
            .unwrap_or(0);
        my_row.set_global_min(base + k, min);
    }
    table.put_range(table.layout().global_min_range());
    my_row.set_global_min_ready(subgroup, true);
    table.put_word(table.layout().global_min_ready(subgroup));
}

/// Read the shard leader's published `global_min` vector for a subgroup, if its ready flag is up.
pub(crate) fn read_global_min<F: Fabric>(
    view: &View,
    table: &SharedStateTable<F>,
    subgroup: SubgroupId,
    shard_index: usize,
) -> Option<Vec<i64>> {
    let shard = &view.subgroup_shard_views[subgroup.index()][shard_index];
    let leader_shard_rank = view.subview_rank_of_shard_leader(subgroup, shard_index)?;
    let leader_view_rank = view.rank_of(shard.members[leader_shard_rank])?;
    let leader_row = table.row(leader_view_rank);
    if !leader_row.global_min_ready(subgroup) {
        return None;
    }
    let base = table.layout().geometry().sender_slot_base(subgroup, shard_index);
    Some(
        (0..shard.num_senders())
            .map(|k| leader_row.global_min(base + k))
            .collect(),
    )
}

/// The membership of the next view, derived from the committed-but-uninstalled slice of the
/// local change log.
pub(crate) struct NextViewPlan {
    pub members: Vec<NodeId>,
    pub addresses: Vec<NodeAddress>,
    pub joined: Vec<Node>,
    pub departed: Vec<NodeId>,
    /// How many change-log entries this plan consumes.
    pub changes_installed: i64,
}

/// Apply `changes[num_installed .. num_committed]` to the current membership: departures remove
/// (preserving the survivors' relative order), joins append in log order.
pub(crate) fn plan_next_view<F: Fabric>(view: &View, table: &SharedStateTable<F>) -> NextViewPlan {
    let my_row = table.my_row();
    let mut members: Vec<NodeId> = view.members.clone();
    let mut addresses: Vec<NodeAddress> = view.member_addresses.clone();
    let mut joined = Vec::new();
    let mut departed = Vec::new();

    let from = my_row.num_installed();
    let to = my_row.num_committed();
    for c in from..to {
        let id = my_row.change(c);
        if let Some(position) = members.iter().position(|m| *m == id) {
            members.remove(position);
            addresses.remove(position);
            departed.push(id);
        } else {
            let node = Node::new(id, my_row.joiner_ip(c));
            members.push(id);
            addresses.push(node.address);
            joined.push(node);
        }
    }

    NextViewPlan {
        members,
        addresses,
        joined,
        departed,
        changes_installed: to - from,
    }
}

/// Initialize the local row of a new view's table from the local row of the previous view's:
/// carry the watermarks forward, advance `num_installed` by the changes this install consumed,
/// and copy the still-pending suffix of the change log. Everything else starts from its zero
/// state.
pub(crate) fn init_row_from_previous<F: Fabric>(
    old: &SharedStateTable<F>,
    new: &SharedStateTable<F>,
    changes_installed: i64,
) {
    let old_row = old.my_row();
    let new_row = new.my_row();
    new_row.set_num_changes(old_row.num_changes());
    new_row.set_num_committed(old_row.num_committed());
    new_row.set_num_acked(old_row.num_acked());
    let num_installed = old_row.num_installed() + changes_installed;
    new_row.set_num_installed(num_installed);
    for c in num_installed..old_row.num_changes() {
        new_row.set_change(c, old_row.change(c));
        new_row.set_joiner_ip(c, old_row.joiner_ip(c));
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::sst::fabric::NullFabric;
    use crate::sst::layout::{RowLayout, SstGeometry};
    use crate::types::data_types::{PayloadSize, ViewId, WindowSize};

    use super::*;

    const CHANGES_CAPACITY: usize = 4;

    fn addr(last_octet: u8) -> NodeAddress {
        NodeAddress::new(Ipv4Addr::new(127, 0, 0, last_octet), 1, 2, 3, 4)
    }

    fn view_of(member_ids: &[u32], my_rank: usize, vid: i32) -> View {
        View::new(
            ViewId::new(vid),
            member_ids.iter().map(|id| NodeId::new(*id)).collect(),
            member_ids.iter().map(|id| addr(*id as u8 + 1)).collect(),
            vec![false; member_ids.len()],
            vec![],
            vec![],
            my_rank,
        )
    }

    fn table_for(view: &View) -> SharedStateTable<NullFabric> {
        let geometry = SstGeometry {
            num_members: view.num_members(),
            num_subgroups: 1,
            sender_slots: view.num_members(),
            changes_capacity: CHANGES_CAPACITY,
            window_size: WindowSize::new(4),
            max_inline_payload: PayloadSize::new(16),
            sender_slot_bases: vec![vec![0]],
        };
        SharedStateTable::new(
            view.vid,
            RowLayout::new(geometry),
            view.members.clone(),
            view.my_rank,
            NullFabric,
        )
    }

    #[test]
    fn merge_adopts_the_longest_log() {
        let view = view_of(&[0, 1, 2], 0, 0);
        let table = table_for(&view);

        // Row 1 arrives with a longer proposal history.
        let peer_row = table.row(1);
        peer_row.set_change(0, NodeId::new(2));
        peer_row.set_num_changes(1);
        peer_row.set_num_committed(1);

        merge_changes(&view, &table);
        let my_row = table.my_row();
        assert_eq!(my_row.num_changes(), 1);
        assert_eq!(my_row.num_committed(), 1);
        assert_eq!(my_row.change(0), NodeId::new(2));
    }

    #[test]
    fn merge_appends_unlisted_failures_once() {
        let mut view = view_of(&[0, 1, 2], 0, 0);
        view.failed[2] = true;
        view.num_failed = 1;
        let table = table_for(&view);

        merge_changes(&view, &table);
        merge_changes(&view, &table);

        let my_row = table.my_row();
        assert_eq!(my_row.num_changes(), 1);
        assert_eq!(my_row.change(0), NodeId::new(2));
    }

    #[test]
    fn commit_requires_a_majority_of_acks() {
        let view = view_of(&[0, 1, 2], 0, 0);
        let table = table_for(&view);

        assert!(propose_join(&table, Node::new(NodeId::new(9), addr(99))));
        table.my_row().set_num_acked(1);
        assert_eq!(try_commit(&view, &table), None);

        table.row(1).set_num_acked(1);
        assert_eq!(try_commit(&view, &table), Some(1));
        assert_eq!(table.my_row().num_committed(), 1);
        // A second attempt with nothing new proposed is a no-op.
        assert_eq!(try_commit(&view, &table), None);
    }

    #[test]
    fn join_plans_append_in_log_order_and_departures_preserve_rank_order() {
        let view = view_of(&[0, 1, 2], 0, 0);
        let table = table_for(&view);
        let my_row = table.my_row();

        my_row.set_change(0, NodeId::new(1)); // departure
        my_row.set_change(1, NodeId::new(7)); // join
        my_row.set_joiner_ip(1, addr(70));
        my_row.set_num_changes(2);
        my_row.set_num_committed(2);

        let plan = plan_next_view(&view, &table);
        assert_eq!(plan.members, vec![NodeId::new(0), NodeId::new(2), NodeId::new(7)]);
        assert_eq!(plan.departed, vec![NodeId::new(1)]);
        assert_eq!(plan.joined.len(), 1);
        assert_eq!(plan.joined[0].address, addr(70));
        assert_eq!(plan.changes_installed, 2);
    }

    #[test]
    fn change_log_wraps_and_every_committed_change_applies_exactly_once() {
        // A run of single-node departures, each committed and installed individually, long
        // enough to wrap the circular log twice over.
        let ids: Vec<u32> = (0..10).collect();
        let mut view = view_of(&ids, 9, 0);
        let mut table = table_for(&view);

        for departing in 0..(2 * CHANGES_CAPACITY as u32) {
            let rank = view.rank_of(NodeId::new(departing)).unwrap();
            view.failed[rank] = true;
            view.num_failed += 1;

            merge_changes(&view, &table);
            table.my_row().set_num_acked(table.my_row().num_changes());
            for other in 0..view.num_members() {
                if other != view.my_rank {
                    table.row(other).set_num_acked(table.my_row().num_changes());
                }
            }
            assert!(try_commit(&view, &table).is_some());

            let plan = plan_next_view(&view, &table);
            assert_eq!(plan.departed, vec![NodeId::new(departing)]);
            assert!(!plan.members.contains(&NodeId::new(departing)));

            let next_view = View::new(
                view.vid + 1,
                plan.members.clone(),
                plan.addresses.clone(),
                vec![false; plan.members.len()],
                vec![],
                plan.departed.clone(),
                plan
                    .members
                    .iter()
                    .position(|m| *m == NodeId::new(9))
                    .unwrap(),
            );
            let next_geometry = SstGeometry {
                num_members: next_view.num_members(),
                num_subgroups: 1,
                sender_slots: next_view.num_members(),
                changes_capacity: CHANGES_CAPACITY,
                window_size: WindowSize::new(4),
                max_inline_payload: PayloadSize::new(16),
                sender_slot_bases: vec![vec![0]],
            };
            let next_table = SharedStateTable::new(
                next_view.vid,
                RowLayout::new(next_geometry),
                next_view.members.clone(),
                next_view.my_rank,
                NullFabric,
            );
            init_row_from_previous(&table, &next_table, plan.changes_installed);

            let row = next_table.my_row();
            assert_eq!(row.num_installed(), row.num_committed());
            assert!(row.num_changes() - row.num_installed() <= CHANGES_CAPACITY as i64);

            view = next_view;
            table = next_table;
        }
        assert_eq!(view.num_members(), 2);
    }

    #[test]
    fn inherited_leadership_needs_universally_visible_suspicions() {
        let mut view = view_of(&[0, 1, 2], 1, 0);
        let table = table_for(&view);
        view.failed[0] = true;
        view.num_failed = 1;
        table.my_row().set_suspected(0, true);

        // Row 2 does not suspect the old leader yet, so rank 1 must not act as leader.
        assert!(!i_am_established_leader(&view, &table));

        table.row(2).set_suspected(0, true);
        assert!(i_am_established_leader(&view, &table));
    }

    #[test]
    fn watermarks_are_monotone_through_a_merge() {
        let view = view_of(&[0, 1], 0, 0);
        let table = table_for(&view);
        let before = (
            table.my_row().num_changes(),
            table.my_row().num_committed(),
            table.my_row().num_acked(),
        );
        acknowledge_changes(&view, &table);
        merge_changes(&view, &table);
        let after = (
            table.my_row().num_changes(),
            table.my_row().num_committed(),
            table.my_row().num_acked(),
        );
        assert!(after.0 >= before.0 && after.1 >= before.1 && after.2 >= before.2);
    }

    #[test]
    fn global_min_ranges_over_sender_slots_of_survivors_only() {
        let mut view = view_of(&[0, 1, 2], 0, 0);
        let everyone = view.members.clone();
        let senders = vec![true; 3];
        let subview = view
            .make_subview(everyone, crate::types::view::Mode::Ordered, senders)
            .unwrap();
        view.install_layout(vec![vec![subview]]);
        let table = table_for(&view);

        for (rank, received) in [(0usize, 5i64), (1, 3), (2, 1)] {
            for k in 0..3 {
                table.row(rank).set_num_received(k, received);
            }
        }
        // Node 2 failed; its low counts must not drag the minimum down.
        view.failed[2] = true;
        view.num_failed = 1;

        publish_global_min(&view, &table, SubgroupId::new(0), 0);
        let min = read_global_min(&view, &table, SubgroupId::new(0), 0).unwrap();
        assert_eq!(min, vec![3, 3, 3]);
    }
}
