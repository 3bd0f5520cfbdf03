//! # BitTorrent Peer Addresses
//!
//! Peers are discovered through tracker communication. The tracker responds
//! with a compact binary list of IPv4 addresses and ports.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use crate::error::TrackerError;

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

const PEER_SIZE: usize = 6;

/// Network location of a BitTorrent peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        PeerAddress { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Parses a compact peer list from a tracker response.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidPeers`] if the list length is not a
    /// multiple of 6 bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use leech::PeerAddress;
    ///
    /// let peers = PeerAddress::parse_compact(&[192, 168, 1, 1, 0x1a, 0xe1]).unwrap();
    /// assert_eq!(peers[0].to_string(), "192.168.1.1:6881");
    /// ```
    pub fn parse_compact(tracker_peers: &[u8]) -> Result<Vec<PeerAddress>, TrackerError> {
        if tracker_peers.len() % PEER_SIZE != 0 {
            return Err(TrackerError::InvalidPeers(tracker_peers.len()));
        }

        let peers = tracker_peers
            .chunks_exact(PEER_SIZE)
            .map(|chunk| PeerAddress {
                ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                port: BigEndian::read_u16(&chunk[4..6]),
            })
            .collect();

        Ok(peers)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s.parse()?;
        Ok(PeerAddress::new(*addr.ip(), addr.port()))
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        PeerAddress::new(*addr.ip(), addr.port())
    }
}
