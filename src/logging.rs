/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the group's
//! [config](crate::config::Configuration).
//!
//! This library logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [Deliver](crate::events::DeliverEvent) is printed:
//!
//! ```text
//! Deliver, 1701329264, 2, 17, aGVsbG8
//! ```
//!
//! In the snippet, the third value is the subgroup, the fourth is the global sequence number, and
//! the fifth is the first seven characters of the Base64 encoding of the delivered payload.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const VIEW_INSTALLED: &str = "ViewInstalled";
pub const SUSPECT: &str = "Suspect";
pub const PROPOSE_CHANGE: &str = "ProposeChange";
pub const COMMIT_CHANGES: &str = "CommitChanges";
pub const WEDGE: &str = "Wedge";
pub const GLOBAL_MIN_READY: &str = "GlobalMinReady";
pub const DELIVER: &str = "Deliver";
pub const RECEIVE_JOIN_REQUEST: &str = "ReceiveJoinRequest";
pub const SEND_STATE_TRANSFER: &str = "SendStateTransfer";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ViewInstalledEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ViewInstalledEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                VIEW_INSTALLED,
                secs_since_unix_epoch(event.timestamp),
                event.vid,
                event.members.iter().map(|m| m.int()).collect::<Vec<_>>()
            )
        };
        Box::new(logger)
    }
}

impl Logger for SuspectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &SuspectEvent| {
            log::info!(
                "{}, {}, {}",
                SUSPECT,
                secs_since_unix_epoch(event.timestamp),
                event.suspect
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ProposeChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.change,
                if event.is_join { "join" } else { "depart" },
                event.num_changes
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitChangesEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &CommitChangesEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT_CHANGES,
                secs_since_unix_epoch(event.timestamp),
                event.num_committed
            )
        };
        Box::new(logger)
    }
}

impl Logger for WedgeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &WedgeEvent| {
            log::info!(
                "{}, {}, {}",
                WEDGE,
                secs_since_unix_epoch(event.timestamp),
                event.vid
            )
        };
        Box::new(logger)
    }
}

impl Logger for GlobalMinReadyEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &GlobalMinReadyEvent| {
            log::info!(
                "{}, {}, {}",
                GLOBAL_MIN_READY,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeliverEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &DeliverEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DELIVER,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup,
                event.seq,
                first_seven_base64_chars(&event.payload)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveJoinRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceiveJoinRequestEvent| {
            log::info!(
                "{}, {}, {}",
                RECEIVE_JOIN_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.joiner
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendStateTransferEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &SendStateTransferEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SEND_STATE_TRANSFER,
                secs_since_unix_epoch(event.timestamp),
                event.joiner,
                event.subgroup,
                event.num_bytes
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
