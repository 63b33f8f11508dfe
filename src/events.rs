/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local group member.
//!
//! ## Event enum
//!
//! Significant occurrences include installing a view, suspecting a member, proposing and
//! committing membership changes, wedging, and delivering a multicast message. Each corresponds
//! to a variant of the [event enum](Event), whose inner struct stores a summary of the
//! occurrence, always including a timestamp taken when the event happened.
//!
//! ## Registering event handlers
//!
//! Library users can register one handler closure per event type through the
//! [group builder](crate::group::GroupSpec); the [event bus](crate::event_bus) thread calls it
//! whenever the event's variant is published. Default handlers that log events in CSV form can
//! be enabled in the [configuration](crate::config::Configuration); they are defined in
//! [logging](crate::logging).
//!
//! Events are emitted **after** the corresponding occurrence completes: the view-installed event
//! is only published once the new view's table and engine are in place.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::data_types::{NodeId, SequenceNumber, SubgroupId, ViewId};

/// Enumerates all events defined for this library.
pub enum Event {
    // Membership events.
    ViewInstalled(ViewInstalledEvent),
    Suspect(SuspectEvent),
    ProposeChange(ProposeChangeEvent),
    CommitChanges(CommitChangesEvent),
    Wedge(WedgeEvent),
    GlobalMinReady(GlobalMinReadyEvent),

    // Multicast events.
    Deliver(DeliverEvent),

    // Join and state-transfer events.
    ReceiveJoinRequest(ReceiveJoinRequestEvent),
    SendStateTransfer(SendStateTransferEvent),
}

impl Event {
    /// Publish this event on the event publisher channel (if a channel is defined).
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A new view was installed: its table and engine exist and the view upcall has run.
pub struct ViewInstalledEvent {
    pub timestamp: SystemTime,
    pub vid: ViewId,
    pub members: Vec<NodeId>,
}

/// The local failure detector began suspecting a member, or adopted a peer's suspicion.
pub struct SuspectEvent {
    pub timestamp: SystemTime,
    pub suspect: NodeId,
}

/// The local node appended a membership change (a join or a departure) to its change log.
pub struct ProposeChangeEvent {
    pub timestamp: SystemTime,
    pub change: NodeId,
    pub is_join: bool,
    pub num_changes: i64,
}

/// The leader advanced the commit watermark over the change log.
pub struct CommitChangesEvent {
    pub timestamp: SystemTime,
    pub num_committed: i64,
}

/// The local node wedged: it stopped accepting new multicasts for this view.
pub struct WedgeEvent {
    pub timestamp: SystemTime,
    pub vid: ViewId,
}

/// A shard leader published the ragged-edge delivery ceiling for a subgroup.
pub struct GlobalMinReadyEvent {
    pub timestamp: SystemTime,
    pub subgroup: SubgroupId,
}

/// A multicast message was delivered to the application.
pub struct DeliverEvent {
    pub timestamp: SystemTime,
    pub subgroup: SubgroupId,
    pub seq: SequenceNumber,
    pub payload: Vec<u8>,
}

/// A joiner contacted the local node's join listener.
pub struct ReceiveJoinRequestEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
}

/// Serialized replicated-object state was pushed to a joiner.
pub struct SendStateTransferEvent {
    pub timestamp: SystemTime,
    pub joiner: NodeId,
    pub subgroup: SubgroupId,
    pub num_bytes: usize,
}
