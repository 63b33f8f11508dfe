/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The TCP join handshake and the state transfer that accompanies it.
//!
//! A joiner connects to the leader's `gms_port` and announces its [`Node`] identity. The leader
//! holds the socket until the join commits and the next view is constructed, then streams back,
//! in order: the serialized current view, the serialized new view, the change-log watermarks the
//! joiner's row must start from, and the serialized state of every replicated object of every
//! subgroup the joiner is a member of (length-prefixed, variable size).
//!
//! Every frame on the wire is `u32` little-endian length followed by a Borsh-encoded value.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};
use indexmap::IndexMap;
use threadpool::ThreadPool;

use crate::events::{Event, ReceiveJoinRequestEvent};
use crate::types::{data_types::TypeTag, node::Node, view::ViewBytes};

use super::manager::ProtocolEvent;

/// How many join connections the listener's worker pool serves concurrently.
const JOIN_WORKERS: usize = 4;

/// What a joiner announces about itself.
#[derive(Clone, Copy, Debug, BorshSerialize, BorshDeserialize)]
pub(crate) struct JoinRequest {
    pub node: Node,
}

/// The change-log position a joiner's fresh row starts from, mirroring the survivors' rows at
/// the moment of install: the three watermarks plus the content of the still-pending log
/// suffix (`num_installed .. num_changes`), in log order.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub(crate) struct ChangeLogWatermarks {
    pub num_changes: i64,
    pub num_committed: i64,
    pub num_installed: i64,
    pub pending: Vec<(crate::types::data_types::NodeId, crate::types::node::NodeAddress)>,
}

/// The serialized replicated-object state for the subgroups a joiner belongs to, keyed by
/// subgroup id.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub(crate) struct StateTransfer {
    pub subgroups: Vec<(u32, Vec<u8>)>,
}

/// Everything a joiner receives back from the leader.
pub(crate) struct JoinGrant {
    pub current_view: ViewBytes,
    pub new_view: ViewBytes,
    pub watermarks: ChangeLogWatermarks,
    pub state: StateTransfer,
}

/// Why the join handshake with the leader failed.
#[derive(Debug)]
pub enum JoinError {
    Io(std::io::Error),
    /// A frame arrived that does not decode as the expected handshake message.
    Malformed,
}

impl From<std::io::Error> for JoinError {
    fn from(err: std::io::Error) -> Self {
        JoinError::Io(err)
    }
}

/// A replicated object that can hand its full state to a joiner and adopt a peer's.
///
/// The registry below is keyed by a stable [`TypeTag`] rather than by compile-time types, so
/// heterogeneous binaries agree on which state belongs to which subgroup by tag alone.
pub trait ReplicatedState: Send {
    /// Serialize the complete current state.
    fn serialize(&self) -> Vec<u8>;

    /// Replace the state with a serialized peer state.
    fn install(&mut self, bytes: &[u8]);
}

/// Runtime registry of the application's replicated-object state, one entry per registered
/// subgroup type, in the same order as the subgroup registry.
pub struct StateRegistry {
    providers: IndexMap<TypeTag, std::sync::Arc<std::sync::Mutex<dyn ReplicatedState>>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self {
            providers: IndexMap::new(),
        }
    }

    pub fn register(
        &mut self,
        tag: TypeTag,
        provider: std::sync::Arc<std::sync::Mutex<dyn ReplicatedState>>,
    ) -> &mut Self {
        self.providers.insert(tag, provider);
        self
    }

    /// Serialize the state registered under the subgroup at registry position `index`.
    pub(crate) fn serialize_at(&self, index: usize) -> Option<Vec<u8>> {
        self.providers
            .get_index(index)
            .map(|(_, provider)| provider.lock().unwrap().serialize())
    }

    /// Install transferred state into the provider at registry position `index`.
    pub(crate) fn install_at(&self, index: usize, bytes: &[u8]) {
        if let Some((_, provider)) = self.providers.get_index(index) {
            provider.lock().unwrap().install(bytes);
        }
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn write_frame<T: BorshSerialize>(
    stream: &mut TcpStream,
    value: &T,
) -> Result<(), JoinError> {
    let bytes = borsh::to_vec(value).map_err(|_| JoinError::Malformed)?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(&bytes)?;
    Ok(())
}

pub(crate) fn read_frame<T: BorshDeserialize>(stream: &mut TcpStream) -> Result<T, JoinError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    T::try_from_slice(&bytes).map_err(|_| JoinError::Malformed)
}

/// Joiner side: connect to the leader, announce ourselves, and block until the leader grants the
/// join with the view pair, our starting watermarks, and our state.
pub(crate) fn request_join(
    leader: SocketAddr,
    me: Node,
    timeout: Duration,
) -> Result<JoinGrant, JoinError> {
    let mut stream = TcpStream::connect_timeout(&leader, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    // The grant only arrives once the join has committed cluster-wide, which takes as long as a
    // view change takes; reads must not time out on the handshake's natural latency.
    stream.set_read_timeout(None)?;
    write_frame(&mut stream, &JoinRequest { node: me })?;

    let current_view: ViewBytes = read_frame(&mut stream)?;
    let new_view: ViewBytes = read_frame(&mut stream)?;
    let watermarks: ChangeLogWatermarks = read_frame(&mut stream)?;
    let state: StateTransfer = read_frame(&mut stream)?;
    Ok(JoinGrant {
        current_view,
        new_view,
        watermarks,
        state,
    })
}

/// Leader side: answer a granted join over the socket the joiner has been waiting on.
pub(crate) fn send_join_grant(
    stream: &mut TcpStream,
    current_view: &ViewBytes,
    new_view: &ViewBytes,
    watermarks: &ChangeLogWatermarks,
    state: &StateTransfer,
) -> Result<(), JoinError> {
    write_frame(stream, current_view)?;
    write_frame(stream, new_view)?;
    write_frame(stream, watermarks)?;
    write_frame(stream, state)?;
    Ok(())
}

/// Spawn the join listener thread.
///
/// It accepts joiner connections on the node's `gms_port`, reads the join request on a worker
/// from a small pool, and hands the request and the open socket to the view manager, which owns
/// them from then on. A non-leader that is contacted simply lets the manager refuse the request.
pub(crate) fn start_join_listener(
    listener: TcpListener,
    socket_timeout: Duration,
    notices: Sender<ProtocolEvent>,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    listener
        .set_nonblocking(true)
        .expect("Irrecoverable: failed to set the join listener non-blocking");
    let pool = ThreadPool::new(JOIN_WORKERS);

    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Join listener thread disconnected from main thread")
            }
        }

        match listener.accept() {
            Ok((stream, _)) => {
                let notices = notices.clone();
                let event_publisher = event_publisher.clone();
                pool.execute(move || {
                    let mut stream = stream;
                    if stream.set_read_timeout(Some(socket_timeout)).is_err()
                        || stream.set_write_timeout(Some(socket_timeout)).is_err()
                    {
                        return;
                    }
                    match read_frame::<JoinRequest>(&mut stream) {
                        Ok(request) => {
                            Event::ReceiveJoinRequest(ReceiveJoinRequestEvent {
                                timestamp: SystemTime::now(),
                                joiner: request.node.id,
                            })
                            .publish(&event_publisher);
                            let _ = notices.send(ProtocolEvent::JoinRequest {
                                node: request.node,
                                stream,
                            });
                        }
                        Err(err) => {
                            log::warn!("malformed join request dropped: {:?}", err);
                        }
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => {
                log::warn!("join listener accept failed: {}", err);
                thread::sleep(Duration::from_millis(50));
            }
        }
    })
}
