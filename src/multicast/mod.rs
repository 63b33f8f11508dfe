/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Totally-ordered reliable multicast within a view.
//!
//! The [engine](engine::MulticastEngine) accepts payloads from local senders, moves them either
//! through the state table's inline slots or through the pluggable
//! [block transport](transport::BlockTransport), and derives a single global delivery order from
//! the state table's counters: a message `(sender k, index i)` has global sequence number
//! `g = k + S·i`, and delivery follows the natural order on `g`.

pub mod engine;

pub mod transport;

use crate::types::data_types::{SequenceNumber, SubgroupId, Version, ViewId};

/// Where an upcall is executing: which view and which subgroup it belongs to.
///
/// The token is threaded through every upcall so reentrancy rules can be checked without global
/// state, and so tests can construct contexts directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallContext {
    pub vid: ViewId,
    pub subgroup: SubgroupId,
}

/// Invoked once per message, in delivery order. Blocking: the next message in order is not
/// delivered until the callback returns.
pub type DeliveryCallback = Box<dyn FnMut(&UpcallContext, SequenceNumber, &[u8]) + Send>;

/// Invoked after a batch of deliveries with the newest delivered version. The application's
/// persistence sink returns the version it has durably retained, which the engine records as the
/// row's persistence watermark.
pub type PersistenceCallback = Box<dyn FnMut(&UpcallContext, Version) -> Version + Send>;

/// Why a send was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The local node is not a member of the requested subgroup.
    SubgroupNotMember,
    /// The local node is a member but not a sender in its shard.
    NotASender,
    /// The payload exceeds the configured maximum payload size.
    PayloadTooLarge,
    /// The engine has wedged for a view change; re-attempt in the next view.
    Wedged,
}
