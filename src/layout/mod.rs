/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic subgroup/shard layout: a pure function from a view and the registered subgroup
//! policies to the per-subgroup, per-shard membership.
//!
//! Every member runs the same layout over the same view and obtains an identical result; nothing
//! about the layout is ever transmitted. A layout that cannot satisfy its policy fails with
//! [`LayoutError::InadequatelyProvisioned`], which aborts the view install attempt and leaves the
//! old view in place.

use indexmap::IndexMap;

use crate::types::{
    data_types::TypeTag,
    view::{Mode, SubView, View},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// The candidate view cannot satisfy some registered subgroup's policy.
    InadequatelyProvisioned,
}

/// Constraints for one shard under the default allocator.
#[derive(Clone, Copy, Debug)]
pub struct ShardPolicy {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub mode: Mode,
}

impl ShardPolicy {
    /// A shard of exactly `nodes` members delivering in total order.
    pub fn fixed(nodes: usize) -> Self {
        Self {
            min_nodes: nodes,
            max_nodes: nodes,
            mode: Mode::Ordered,
        }
    }

    /// A shard spanning between `min_nodes` and `max_nodes` members.
    pub fn flexible(min_nodes: usize, max_nodes: usize, mode: Mode) -> Self {
        Self {
            min_nodes,
            max_nodes,
            mode,
        }
    }
}

/// A callback that slices a view into the shards of one subgroup.
///
/// The callback must be a pure function of the view: every member invokes it with the same view
/// and must obtain the same shards.
pub type LayoutFn = Box<dyn Fn(&View) -> Result<Vec<SubView>, LayoutError> + Send + Sync>;

/// How one registered subgroup type's membership is derived from a view.
pub enum SubgroupPolicy {
    /// The application supplies the slicing function.
    Explicit(LayoutFn),
    /// The default allocator assigns members to shards, consuming the view's
    /// `next_unassigned_rank` cursor.
    Automatic { shards: Vec<ShardPolicy> },
}

/// The ordered registry of subgroup types.
///
/// Registration order is significant: it determines subgroup IDs and must be identical in every
/// binary of the group.
pub struct SubgroupRegistry {
    policies: IndexMap<TypeTag, SubgroupPolicy>,
}

impl SubgroupRegistry {
    pub fn new() -> Self {
        Self {
            policies: IndexMap::new(),
        }
    }

    /// Register a subgroup type. The subgroup's ID is its registration position.
    pub fn register(&mut self, tag: TypeTag, policy: SubgroupPolicy) -> &mut Self {
        self.policies.insert(tag, policy);
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The registration position of `tag`, which doubles as its subgroup ID.
    pub fn position(&self, tag: TypeTag) -> Option<usize> {
        self.policies.get_index_of(&tag)
    }

    /// The tags in registration order.
    pub fn tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.policies.keys().copied()
    }

    /// Compute the layout of every registered subgroup over `view` and install it on the view.
    ///
    /// On failure the view is left without a layout and the caller must abandon the install.
    pub fn provision(&self, view: &mut View) -> Result<(), LayoutError> {
        view.next_unassigned_rank = 0;
        let mut layout = Vec::with_capacity(self.policies.len());
        for policy in self.policies.values() {
            let shards = match policy {
                SubgroupPolicy::Explicit(layout_fn) => layout_fn(view)?,
                SubgroupPolicy::Automatic { shards } => allocate_shards(view, shards)?,
            };
            layout.push(shards);
        }
        view.install_layout(layout);
        Ok(())
    }
}

impl Default for SubgroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The default allocator: walk the view's members in rank order starting at the allocation
/// cursor, skipping failed members, and deal out each shard's membership in turn.
///
/// Every member of a shard is a sender under this allocator.
fn allocate_shards(view: &mut View, shards: &[ShardPolicy]) -> Result<Vec<SubView>, LayoutError> {
    let mut subviews = Vec::with_capacity(shards.len());
    for shard in shards {
        let mut members = Vec::with_capacity(shard.max_nodes);
        let mut cursor = view.next_unassigned_rank;
        while members.len() < shard.max_nodes && cursor < view.num_members() {
            if !view.failed[cursor] {
                members.push(view.members[cursor]);
            }
            cursor += 1;
        }
        if members.len() < shard.min_nodes {
            return Err(LayoutError::InadequatelyProvisioned);
        }
        view.next_unassigned_rank = cursor;
        let is_sender = vec![true; members.len()];
        subviews.push(view.make_subview(members, shard.mode, is_sender)?);
    }
    Ok(subviews)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::types::{
        data_types::{NodeId, SubgroupId, ViewId},
        node::NodeAddress,
    };

    use super::*;

    fn view_of(n: u32) -> View {
        let members = (0..n).map(NodeId::new).collect::<Vec<_>>();
        let addresses = (0..n)
            .map(|i| NodeAddress::new(Ipv4Addr::new(127, 0, 0, i as u8 + 1), 1, 2, 3, 4))
            .collect();
        View::new(
            ViewId::init(),
            members,
            addresses,
            vec![false; n as usize],
            vec![],
            vec![],
            0,
        )
    }

    fn registry(policies: Vec<(u64, SubgroupPolicy)>) -> SubgroupRegistry {
        let mut registry = SubgroupRegistry::new();
        for (tag, policy) in policies {
            registry.register(TypeTag::new(tag), policy);
        }
        registry
    }

    #[test]
    fn automatic_allocation_is_deterministic() {
        let registry = registry(vec![(
            7,
            SubgroupPolicy::Automatic {
                shards: vec![ShardPolicy::fixed(2), ShardPolicy::fixed(2)],
            },
        )]);

        let mut first = view_of(4);
        let mut second = view_of(4);
        registry.provision(&mut first).unwrap();
        registry.provision(&mut second).unwrap();
        assert_eq!(first.subgroup_shard_views, second.subgroup_shard_views);

        let shards = &first.subgroup_shard_views[0];
        assert_eq!(shards[0].members, vec![NodeId::new(0), NodeId::new(1)]);
        assert_eq!(shards[1].members, vec![NodeId::new(2), NodeId::new(3)]);
        assert_eq!(first.my_subgroups.get(&SubgroupId::new(0)), Some(&0));
    }

    #[test]
    fn underprovisioned_view_is_rejected() {
        let registry = registry(vec![(
            7,
            SubgroupPolicy::Automatic {
                shards: vec![ShardPolicy::fixed(3)],
            },
        )]);
        let mut view = view_of(2);
        assert_eq!(
            registry.provision(&mut view),
            Err(LayoutError::InadequatelyProvisioned)
        );
        assert!(view.subgroup_shard_views.is_empty());
    }

    #[test]
    fn failed_members_are_skipped() {
        let registry = registry(vec![(
            7,
            SubgroupPolicy::Automatic {
                shards: vec![ShardPolicy::flexible(2, 3, Mode::Ordered)],
            },
        )]);
        let mut view = view_of(4);
        view.failed[1] = true;
        view.num_failed = 1;
        registry.provision(&mut view).unwrap();
        assert_eq!(
            view.subgroup_shard_views[0][0].members,
            vec![NodeId::new(0), NodeId::new(2), NodeId::new(3)]
        );
    }

    #[test]
    fn explicit_callback_layout() {
        let registry = registry(vec![(
            9,
            SubgroupPolicy::Explicit(Box::new(|view| {
                let everyone = view.members.clone();
                let senders = vec![true; everyone.len()];
                Ok(vec![view.make_subview(everyone, Mode::Unordered, senders)?])
            })),
        )]);
        let mut view = view_of(3);
        registry.provision(&mut view).unwrap();
        assert_eq!(view.subgroup_shard_views[0][0].mode, Mode::Unordered);
        assert_eq!(view.subgroup_shard_views[0][0].num_senders(), 3);
    }
}
