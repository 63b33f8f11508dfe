/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store small values, and do not have any major "active" behavior.

use std::{
    fmt::{self, Display, Formatter},
    ops::{Add, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a node for the life of its process.
///
/// Node IDs are assigned by the operator and are assumed to be unique and stable; they are never
/// recycled while a process is alive. Rank within a [`View`](super::view::View) is derived from a
/// node's position in the view's member list, not from its ID.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a new `NodeId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `NodeId`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// View ID. Starts at 0 in the first view a group ever installs and increases by at least 1 with
/// every subsequent install.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewId(i32);

impl ViewId {
    /// Create a new `ViewId` wrapping `int`.
    pub const fn new(int: i32) -> Self {
        Self(int)
    }

    /// Get the initial `ViewId`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `i32` of this `ViewId`.
    pub const fn int(&self) -> i32 {
        self.0
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<i32> for ViewId {
    type Output = ViewId;

    fn add(self, rhs: i32) -> Self::Output {
        ViewId(self.0.add(rhs))
    }
}

/// Index of a subgroup within a view.
///
/// Subgroup IDs are positions in the deterministic ordering of registered subgroup types, so every
/// member of a view computes the same ID for the same subgroup.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SubgroupId(u32);

impl SubgroupId {
    /// Create a new `SubgroupId` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `SubgroupId`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the inner value as a `usize`, for indexing.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Global sequence number of a multicast message within one subgroup and one view.
///
/// A message from the sender with dense sender rank `k`, carrying per-sender index `i`, has the
/// global sequence number `k + num_senders · i`. Delivery follows the natural order on these
/// numbers. The value −1 denotes "nothing yet".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Create a new `SequenceNumber` wrapping `int`.
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    /// The sequence number before any message: −1.
    pub const fn init() -> Self {
        Self(-1)
    }

    /// Get the inner `i64` of this `SequenceNumber`.
    pub const fn int(&self) -> i64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: i64) -> Self::Output {
        SequenceNumber(self.0.add(rhs))
    }
}

impl Sub<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: i64) -> Self::Output {
        SequenceNumber(self.0.sub(rhs))
    }
}

/// Persistent version number reported back by the application's persistence sink.
///
/// Versions share the numbering of [`SequenceNumber`]s; the watermark recorded into the state
/// table's `persisted_num` field never exceeds `delivered_num`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct Version(i64);

impl Version {
    /// Create a new `Version` wrapping `int`.
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    /// Get the inner `i64` of this `Version`.
    pub const fn int(&self) -> i64 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Stable identifier of a registered subgroup type.
///
/// Type tags are chosen by the application and must be identical across every binary in the group;
/// the registration *order* of tags determines subgroup IDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct TypeTag(u64);

impl TypeTag {
    /// Create a new `TypeTag` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` of this `TypeTag`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Number of outstanding multicast messages each sender may have in one subgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WindowSize(u32);

impl WindowSize {
    /// Create a new `WindowSize` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `WindowSize`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the inner value as a `usize`, for indexing.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Size of a message payload (in bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct PayloadSize(u32);

impl PayloadSize {
    /// Create a new `PayloadSize` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `PayloadSize`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the inner value as a `usize`.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}
