/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Node identity: a stable ID together with the five-tuple of address and ports a node listens on.

use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::NodeId;

/// The IPv4 address and the four ports a node listens on.
///
/// The IP address is stored as a `u32` in network byte order so that the whole address can be
/// packed into state-table words (the state table does not support variable-length strings).
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct NodeAddress {
    /// IPv4 address, packed in network byte order.
    pub ip: u32,
    /// Port of the membership service's join listener.
    pub gms_port: u16,
    /// Port of the block multicast transport.
    pub rdmc_port: u16,
    /// Port of the state table fabric.
    pub sst_port: u16,
    /// Port offered to external (non-member) clients.
    pub external_port: u16,
}

impl NodeAddress {
    pub fn new(ip: Ipv4Addr, gms_port: u16, rdmc_port: u16, sst_port: u16, external_port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes(ip.octets()),
            gms_port,
            rdmc_port,
            sst_port,
            external_port,
        }
    }

    /// Get the IP address in its unpacked form.
    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.to_be_bytes())
    }

    /// The socket address of the join listener at this node.
    pub fn gms_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr(), self.gms_port))
    }

    /// Pack this address into two state-table words.
    ///
    /// Word 0 holds the IP address and the gms and rdmc ports; word 1 holds the sst and external
    /// ports. `unpack` reverses this exactly.
    pub fn pack(&self) -> [i64; 2] {
        let w0 = ((self.ip as u64) << 32) | ((self.gms_port as u64) << 16) | self.rdmc_port as u64;
        let w1 = ((self.sst_port as u64) << 16) | self.external_port as u64;
        [w0 as i64, w1 as i64]
    }

    /// Unpack an address previously packed with [`pack`](Self::pack).
    pub fn unpack(words: [i64; 2]) -> Self {
        let w0 = words[0] as u64;
        let w1 = words[1] as u64;
        Self {
            ip: (w0 >> 32) as u32,
            gms_port: ((w0 >> 16) & 0xffff) as u16,
            rdmc_port: (w0 & 0xffff) as u16,
            sst_port: ((w1 >> 16) & 0xffff) as u16,
            external_port: (w1 & 0xffff) as u16,
        }
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}/{}",
            self.ip_addr(),
            self.gms_port,
            self.rdmc_port,
            self.sst_port,
            self.external_port
        )
    }
}

/// A node: stable ID plus listening addresses. This is what a joiner announces about itself in the
/// join handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Node {
    pub id: NodeId,
    pub address: NodeAddress,
}

impl Node {
    pub fn new(id: NodeId, address: NodeAddress) -> Self {
        Self { id, address }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_pack_round_trip() {
        let addr = NodeAddress::new(Ipv4Addr::new(10, 1, 2, 3), 28000, 28001, 28002, 28003);
        assert_eq!(NodeAddress::unpack(addr.pack()), addr);
    }
}
