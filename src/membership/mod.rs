/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The membership service: failure detection, change proposal and agreement over the state
//! table, the wedge → ragged-edge cleanup → install view-change protocol, and the TCP join
//! handshake with state transfer.

pub(crate) mod failure_detector;

pub mod join;

pub(crate) mod manager;

pub(crate) mod protocol;

pub use join::{JoinError, ReplicatedState, StateRegistry};
pub use manager::ViewCallback;
