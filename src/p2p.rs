/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pending point-to-point results.
//!
//! The RPC layer above this crate marshals point-to-point queries and replies; this module owns
//! only the table of outstanding results and its interaction with view changes: a pending result
//! never blocks a view change, and every result whose target departs the view is completed with
//! [`P2pError::NodeRemoved`] as soon as the new view is known, with no further reply expected.
//!
//! Cascading point-to-point sends (a handler issuing a further p2p query on behalf of the
//! caller) are not supported.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::data_types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum P2pError {
    /// The query's target left the view before replying.
    NodeRemoved,
}

/// Identifies one outstanding query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// The receiving end of one outstanding query's result.
pub struct ReplyPromise {
    receiver: Receiver<Result<Vec<u8>, P2pError>>,
}

impl ReplyPromise {
    /// Return the reply if it has already arrived.
    pub fn try_reply(&self) -> Option<Result<Vec<u8>, P2pError>> {
        self.receiver.try_recv().ok()
    }

    /// Block until the reply arrives or `timeout` passes.
    pub fn wait_reply(&self, timeout: Duration) -> Option<Result<Vec<u8>, P2pError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

struct Pending {
    target: NodeId,
    reply: Sender<Result<Vec<u8>, P2pError>>,
}

/// The table of outstanding point-to-point queries, shared between the RPC layer (which
/// registers and completes them) and the view manager (which fails them on departure).
///
/// The registry is guarded by one coarse mutex; nothing done under the lock touches the fabric.
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

struct Inner {
    pending: HashMap<RequestId, Pending>,
    next_id: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Register an outstanding query addressed to `target`.
    pub fn register(&self, target: NodeId) -> (RequestId, ReplyPromise) {
        let (reply, receiver) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap();
        let id = RequestId(inner.next_id);
        inner.next_id += 1;
        inner.pending.insert(id, Pending { target, reply });
        (id, ReplyPromise { receiver })
    }

    /// Complete an outstanding query with its reply bytes. Unknown IDs (already completed or
    /// already failed) are ignored.
    pub fn complete(&self, id: RequestId, reply_bytes: Vec<u8>) {
        let pending = self.inner.lock().unwrap().pending.remove(&id);
        if let Some(pending) = pending {
            let _ = pending.reply.send(Ok(reply_bytes));
        }
    }

    /// Fail every outstanding query addressed to one of `departed` with
    /// [`P2pError::NodeRemoved`]. Called by the view manager as soon as the next view's
    /// membership is known.
    pub fn complete_departed(&self, departed: &[NodeId]) {
        let mut inner = self.inner.lock().unwrap();
        let removed: Vec<RequestId> = inner
            .pending
            .iter()
            .filter(|(_, pending)| departed.contains(&pending.target))
            .map(|(id, _)| *id)
            .collect();
        for id in removed {
            if let Some(pending) = inner.pending.remove(&id) {
                let _ = pending.reply.send(Err(P2pError::NodeRemoved));
            }
        }
    }

    /// How many queries are outstanding.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn departed_targets_fail_with_node_removed() {
        let requests = PendingRequests::new();
        let (_, to_removed) = requests.register(NodeId::new(2));
        let (id, to_survivor) = requests.register(NodeId::new(3));

        requests.complete_departed(&[NodeId::new(2)]);
        assert_eq!(to_removed.try_reply(), Some(Err(P2pError::NodeRemoved)));
        assert_eq!(to_survivor.try_reply(), None);

        requests.complete(id, b"reply".to_vec());
        assert_eq!(to_survivor.try_reply(), Some(Ok(b"reply".to_vec())));
        assert!(requests.is_empty());
    }
}
