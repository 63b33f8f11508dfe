/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the pluggable one-sided-write fabric the state table is replicated over.
//!
//! Main trait: [`Fabric`]. An RDMA provider maps `write` onto one-sided remote writes; the TCP
//! fallback ships word ranges as frames. The fabric does not interpret field semantics: it moves
//! word ranges between same-shaped tables.

use std::sync::{
    mpsc::{Receiver, TryRecvError},
    Arc,
};
use std::thread::{self, JoinHandle};

use crate::types::{
    data_types::{NodeId, ViewId},
    view::View,
};

use super::SharedStateTable;

/// A word-range update that arrived from a peer's row.
#[derive(Clone, Debug)]
pub struct RowUpdate {
    /// The node whose row the words belong to.
    pub origin: NodeId,
    /// The view whose table the write was addressed to. Tables drop updates for other views, so
    /// a straggler from a superseded view cannot corrupt its successor's rows.
    pub vid: ViewId,
    /// Word offset of the range within the row.
    pub offset: usize,
    pub words: Vec<i64>,
}

#[derive(Debug)]
pub enum FabricError {
    /// The peer's row memory could not be written. The caller treats this as a failure suspicion;
    /// it is never surfaced to the application directly.
    Unreachable,
}

/// Trait for the pluggable state-table fabric.
///
/// Implementations are cheaply cloneable handles onto shared connections, the way a network
/// provider hands out handles onto one connection pool.
///
/// Views install at slightly different moments on different nodes, so an implementation must
/// buffer received updates addressed to a view it has not installed yet and replay them from
/// `recv` once `install_view` catches up; updates addressed to superseded views may be dropped.
pub trait Fabric: Clone + Send + 'static {
    /// (Re)bind the fabric to the membership of `view`. Called once before each view's table is
    /// constructed; rows of nodes outside the view are never written again.
    fn install_view(&mut self, view: &View);

    /// Write `words` into the local node's row replica at `peer`, starting at word `offset` of
    /// the table belonging to view `vid`.
    ///
    /// Completion means the words left the local buffer; peers observe them by polling memory.
    fn write(
        &mut self,
        peer: NodeId,
        vid: ViewId,
        offset: usize,
        words: &[i64],
    ) -> Result<(), FabricError>;

    /// Receive one row update from any peer. Returns immediately with `None` if nothing arrived.
    fn recv(&mut self) -> Option<RowUpdate>;
}

/// A fabric whose writes vanish, for unit tests that only exercise the local table replica.
#[cfg(test)]
#[derive(Clone)]
pub(crate) struct NullFabric;

#[cfg(test)]
impl Fabric for NullFabric {
    fn install_view(&mut self, _view: &View) {}

    fn write(
        &mut self,
        _peer: NodeId,
        _vid: ViewId,
        _offset: usize,
        _words: &[i64],
    ) -> Result<(), FabricError> {
        Ok(())
    }

    fn recv(&mut self) -> Option<RowUpdate> {
        None
    }
}

/// Spawn the fabric poller thread, which drains incoming [`RowUpdate`]s and applies them to the
/// local table replica.
///
/// One poller exists per table, and both die together at view install.
pub(crate) fn start_fabric_poller<F: Fabric>(
    mut fabric: F,
    table: Arc<SharedStateTable<F>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Fabric poller thread disconnected from its owner")
            }
        }

        if let Some(update) = fabric.recv() {
            table.apply_update(&update);
        } else {
            thread::yield_now()
        }
    })
}
