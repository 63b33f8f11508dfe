/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that describe an agreed-upon membership snapshot: [`View`], [`SubView`], and the
//! per-shard delivery [`Mode`].

use std::collections::HashMap;
use std::fmt::Write as _;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::layout::LayoutError;

use super::{
    data_types::{NodeId, SubgroupId, ViewId},
    node::NodeAddress,
};

/// Delivery mode of one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum Mode {
    /// Total order across all senders of the shard.
    Ordered,
    /// Reliable delivery only; messages are delivered as soon as they are locally received.
    Unordered,
    /// No sequencing at all; payloads bypass the delivery counters entirely.
    Raw,
}

/// The membership of one shard of one subgroup within a view.
#[derive(Clone, Debug, PartialEq, BorshDeserialize, BorshSerialize)]
pub struct SubView {
    pub mode: Mode,
    /// Ordered members of this shard. Rank within the shard is the index here.
    pub members: Vec<NodeId>,
    /// Parallel to `members`: whether each member sends in this shard.
    pub is_sender: Vec<bool>,
    /// Parallel to `members`.
    pub member_addresses: Vec<NodeAddress>,
    /// Members of this shard that were not members of it in the previous view.
    pub joined: Vec<NodeId>,
    /// Members of the previous view's version of this shard that are gone now.
    pub departed: Vec<NodeId>,
    /// The local node's rank in `members`, or `None` if the local node is not a member.
    ///
    /// Never serialized; every receiver recomputes it.
    #[borsh(skip)]
    pub my_rank: Option<usize>,
}

impl SubView {
    pub fn new(
        mode: Mode,
        members: Vec<NodeId>,
        is_sender: Vec<bool>,
        member_addresses: Vec<NodeAddress>,
    ) -> Self {
        // If no sender information is provided, every member is a sender.
        let is_sender = if is_sender.is_empty() {
            vec![true; members.len()]
        } else {
            is_sender
        };
        Self {
            mode,
            members,
            is_sender,
            member_addresses,
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank: None,
        }
    }

    /// Get the rank of `who` in this shard, if it is a member.
    pub fn rank_of(&self, who: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == who)
    }

    /// Get the dense rank of the member at shard rank `rank` among the shard's senders, or `None`
    /// if that member is not a sender.
    pub fn sender_rank_of(&self, rank: usize) -> Option<usize> {
        if !self.is_sender[rank] {
            return None;
        }
        Some(self.is_sender[..rank].iter().filter(|s| **s).count())
    }

    /// How many members of this shard are senders.
    pub fn num_senders(&self) -> usize {
        self.is_sender.iter().filter(|s| **s).count()
    }
}

/// An agreed-upon, numbered snapshot of the group membership, with its derived subgroup/shard
/// structure.
///
/// ## Invariants
///
/// `members` is duplicate-free and order-significant: rank is identity within a view. `failed[i]`
/// is monotone within a view (once true, never false), and the view stays adequately provisioned
/// only while `num_failed ≤ ⌊members.len()/2⌋`. Successive views satisfy
/// `members(V') = (members(V) \ departed) ∪ joined`, preserving the relative order of survivors.
///
/// ## Serialization
///
/// `View` serializes through [`ViewBytes`]: `my_rank`, `next_unassigned_rank`, and the computed
/// layout are never transmitted, since each node must recompute the layout independently and
/// ranks are relative to the receiver.
#[derive(Clone, Debug)]
pub struct View {
    pub vid: ViewId,
    pub members: Vec<NodeId>,
    /// Parallel to `members`.
    pub member_addresses: Vec<NodeAddress>,
    /// Parallel to `members`; monotone within the view.
    pub failed: Vec<bool>,
    pub num_failed: usize,
    /// Members that joined relative to the previous view.
    pub joined: Vec<NodeId>,
    /// Members of the previous view that are gone in this one.
    pub departed: Vec<NodeId>,
    /// The local node's rank in `members`.
    pub my_rank: usize,
    /// Allocator cursor for the default subgroup layout; never serialized.
    pub next_unassigned_rank: usize,
    /// Outer index: subgroup id. Inner index: shard index.
    pub subgroup_shard_views: Vec<Vec<SubView>>,
    /// For each subgroup the local node belongs to, the shard index it belongs to.
    pub my_subgroups: HashMap<SubgroupId, usize>,
    node_id_to_rank: HashMap<NodeId, usize>,
}

impl View {
    pub fn new(
        vid: ViewId,
        members: Vec<NodeId>,
        member_addresses: Vec<NodeAddress>,
        failed: Vec<bool>,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        my_rank: usize,
    ) -> Self {
        let node_id_to_rank = members
            .iter()
            .enumerate()
            .map(|(rank, id)| (*id, rank))
            .collect();
        let num_failed = failed.iter().filter(|f| **f).count();
        Self {
            vid,
            members,
            member_addresses,
            failed,
            num_failed,
            joined,
            departed,
            my_rank,
            next_unassigned_rank: 0,
            subgroup_shard_views: Vec::new(),
            my_subgroups: HashMap::new(),
            node_id_to_rank,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Get the rank of `who` in this view, if it is a member.
    pub fn rank_of(&self, who: NodeId) -> Option<usize> {
        self.node_id_to_rank.get(&who).copied()
    }

    /// The rank of the group leader: the lowest-ranked member that has not failed.
    pub fn rank_of_leader(&self) -> Option<usize> {
        self.failed.iter().position(|f| !*f)
    }

    /// True if the local node knows itself to be the leader.
    pub fn i_am_leader(&self) -> bool {
        self.rank_of_leader() == Some(self.my_rank)
    }

    /// The node at `rank`.
    pub fn member_at(&self, rank: usize) -> NodeId {
        self.members[rank]
    }

    /// The address of the member at `rank`.
    pub fn address_at(&self, rank: usize) -> NodeAddress {
        self.member_addresses[rank]
    }

    /// Construct a [`SubView`] over `with_members`, which must all be members of this view.
    ///
    /// Fails with [`LayoutError::InadequatelyProvisioned`] if any requested node is not in the
    /// view, matching the layout functions that call this.
    pub fn make_subview(
        &self,
        with_members: Vec<NodeId>,
        mode: Mode,
        is_sender: Vec<bool>,
    ) -> Result<SubView, LayoutError> {
        let mut member_addresses = Vec::with_capacity(with_members.len());
        for member in &with_members {
            let rank = self
                .rank_of(*member)
                .ok_or(LayoutError::InadequatelyProvisioned)?;
            member_addresses.push(self.member_addresses[rank]);
        }
        Ok(SubView::new(mode, with_members, is_sender, member_addresses))
    }

    /// The shard-internal rank of the shard leader: the lowest-ranked member of the shard that has
    /// not failed in this view. `None` if the whole shard has failed or the shard does not exist.
    pub fn subview_rank_of_shard_leader(
        &self,
        subgroup_id: SubgroupId,
        shard_index: usize,
    ) -> Option<usize> {
        let shard = self
            .subgroup_shard_views
            .get(subgroup_id.index())?
            .get(shard_index)?;
        shard.members.iter().position(|member| {
            self.rank_of(*member)
                .map(|rank| !self.failed[rank])
                .unwrap_or(false)
        })
    }

    /// Record the computed layout on this view, filling in each shard's `my_rank` and the local
    /// node's `my_subgroups` index.
    pub fn install_layout(&mut self, layout: Vec<Vec<SubView>>) {
        let my_id = self.members[self.my_rank];
        self.subgroup_shard_views = layout;
        self.my_subgroups.clear();
        for (subgroup, shards) in self.subgroup_shard_views.iter_mut().enumerate() {
            for (shard_index, shard) in shards.iter_mut().enumerate() {
                shard.my_rank = shard.rank_of(my_id);
                if shard.my_rank.is_some() {
                    self.my_subgroups
                        .insert(SubgroupId::new(subgroup as u32), shard_index);
                }
            }
        }
    }

    pub fn debug_string(&self) -> String {
        let mut s = String::new();
        let _ = write!(s, "View {}: MyRank={}. Members={{", self.vid, self.my_rank);
        for member in &self.members {
            let _ = write!(s, " {}", member);
        }
        let _ = write!(s, " }}, Failed={{");
        for failed in &self.failed {
            let _ = write!(s, " {}", if *failed { "T" } else { "F" });
        }
        let _ = write!(s, " }}, num_failed={}", self.num_failed);
        let _ = write!(s, ", Departed={:?}, Joined={:?}", self.departed, self.joined);
        for (subgroup, shards) in self.subgroup_shard_views.iter().enumerate() {
            for (shard_index, shard) in shards.iter().enumerate() {
                let _ = write!(
                    s,
                    " Shard({}, {}): {:?} senders={:?}.",
                    subgroup, shard_index, shard.members, shard.is_sender
                );
            }
        }
        s
    }
}

/// Intermediate representation of [`View`] for serialization.
///
/// `my_rank`, `next_unassigned_rank`, and the computed layout are deliberately absent: the
/// receiver recomputes its own rank from the member list and re-runs the layout functions
/// independently.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ViewBytes {
    pub vid: ViewId,
    pub members: Vec<NodeId>,
    pub member_addresses: Vec<NodeAddress>,
    pub failed: Vec<bool>,
    pub joined: Vec<NodeId>,
    pub departed: Vec<NodeId>,
}

impl From<&View> for ViewBytes {
    fn from(view: &View) -> Self {
        Self {
            vid: view.vid,
            members: view.members.clone(),
            member_addresses: view.member_addresses.clone(),
            failed: view.failed.clone(),
            joined: view.joined.clone(),
            departed: view.departed.clone(),
        }
    }
}

impl ViewBytes {
    /// Reconstruct a [`View`] for the local node `me`. Fails if `me` is not in the member list.
    ///
    /// The layout is left empty; callers re-run the layout functions and call
    /// [`View::install_layout`].
    pub fn into_view(self, me: NodeId) -> Option<View> {
        let my_rank = self.members.iter().position(|m| *m == me)?;
        Some(View::new(
            self.vid,
            self.members,
            self.member_addresses,
            self.failed,
            self.joined,
            self.departed,
            my_rank,
        ))
    }
}
