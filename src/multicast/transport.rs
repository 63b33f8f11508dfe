//! Trait for the pluggable block multicast transport used by messages that exceed the inline
//! threshold.
//!
//! Main trait: [`BlockTransport`]. An RDMA multicast provider maps `send` onto a block
//! transfer; the TCP fallback fans the payload out over per-peer streams. The transport's
//! contract is reliable, per-sender-FIFO delivery of whole payloads to the receivers registered
//! for a subgroup; ordering across senders is the engine's job, not the transport's.

use crate::types::{
    data_types::{NodeId, SubgroupId},
    view::View,
};

/// A payload that arrived from a peer through the block transport.
#[derive(Clone, Debug)]
pub struct BlockMessage {
    pub subgroup: SubgroupId,
    pub sender: NodeId,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum TransportError {
    /// The block could not be handed to one of the receivers. Treated as a failure suspicion of
    /// that receiver.
    Unreachable(NodeId),
}

/// Trait for the pluggable block multicast transport.
pub trait BlockTransport: Clone + Send + 'static {
    /// (Re)bind the transport to the membership of `view`.
    fn install_view(&mut self, view: &View);

    /// Reliably send `payload` to every node in `receivers`, without blocking on remote delivery.
    fn send(
        &mut self,
        subgroup: SubgroupId,
        receivers: &[NodeId],
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Receive one payload from any sender. Returns immediately with `None` if nothing arrived.
    fn recv(&mut self) -> Option<BlockMessage>;
}
