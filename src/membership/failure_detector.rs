/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The failure detector thread.
//!
//! Each member keeps `local_stability_frontier[s]` in its row: a wall-clock timestamp that the
//! multicast engine bumps whenever subgroup `s` makes progress, and that this thread bumps
//! periodically as an idle heartbeat. The thread suspects a member once none of its frontier
//! entries has moved for longer than the configured timeout, and whenever the fabric has marked
//! the member's row unwritable.
//!
//! Suspicions are reported to the view manager as protocol events; this thread never writes
//! another member's state.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::MembershipConfig;
use crate::sst::{fabric::Fabric, now_millis, SharedStateTable};
use crate::types::data_types::SubgroupId;
use crate::types::view::View;

use super::manager::ProtocolEvent;

/// Spawn the failure detector for one view's table. Torn down with the rest of the view's
/// resources at install.
pub(crate) fn start_failure_detector<F: Fabric>(
    view: Arc<View>,
    table: Arc<SharedStateTable<F>>,
    config: MembershipConfig,
    notices: Sender<ProtocolEvent>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let num_subgroups = table.layout().geometry().num_subgroups;
        loop {
            match shutdown_signal.recv_timeout(config.heartbeat_interval) {
                Ok(()) => return,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("Failure detector thread disconnected from its owner")
                }
            }

            // Heartbeat: publish our own frontier so idle peers do not suspect us.
            let now = now_millis();
            let my_row = table.my_row();
            for subgroup in 0..num_subgroups {
                my_row.set_local_stability_frontier(SubgroupId::new(subgroup as u32), now);
            }
            if num_subgroups > 0 {
                table.put_range(table.layout().local_stability_frontier_range());
            }

            // Suspect members whose frontier has stalled everywhere, or whose row the fabric
            // could not write.
            let timeout_millis = config.suspicion_timeout.as_millis() as i64;
            for rank in 0..view.num_members() {
                if rank == view.my_rank || view.failed[rank] {
                    continue;
                }
                let unreachable = table.is_unreachable(rank);
                let stalled = num_subgroups > 0 && {
                    let row = table.row(rank);
                    let newest = (0..num_subgroups)
                        .map(|s| row.local_stability_frontier(SubgroupId::new(s as u32)))
                        .max()
                        .unwrap_or(0);
                    now - newest > timeout_millis
                };
                if unreachable || stalled {
                    let _ = notices.send(ProtocolEvent::Suspect { rank });
                }
            }
        }
    })
}
