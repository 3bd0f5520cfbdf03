//! # BitTorrent Handshake Protocol
//!
//! This module implements the initial handshake used to establish
//! communication between BitTorrent peers.
//!
//! ## Message Format
//!
//! The handshake is a fixed 68-byte message:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: 19 bytes - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, no extensions are negotiated
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! ## Validation
//!
//! The reply must carry the exact protocol string and our info hash; a
//! different info hash means we reached a peer of another swarm.

use crate::error::HandshakeError;

use std::io::{Read, Write};

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_ID.len();

/// Represents a BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 8 reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte unique identifier of the sender
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new handshake with all reserved bytes cleared.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary
    /// * `peer_id` - 20-byte unique identifier for this client
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut serialized = [0u8; HANDSHAKE_LEN];
        serialized[0] = PROTOCOL_ID.len() as u8;
        serialized[1..20].copy_from_slice(PROTOCOL_ID);
        serialized[20..28].copy_from_slice(&self.reserved);
        serialized[28..48].copy_from_slice(&self.info_hash);
        serialized[48..68].copy_from_slice(&self.peer_id);
        serialized
    }

    /// Parses a received 68-byte handshake.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::ProtocolMismatch`] if the length byte or the protocol
    /// string is not exactly "BitTorrent protocol".
    pub fn deserialize(buf: &[u8; HANDSHAKE_LEN]) -> Result<Handshake, HandshakeError> {
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(HandshakeError::ProtocolMismatch);
        }

        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);

        Ok(handshake)
    }
}

/// Send our handshake.
pub fn send<W: Write>(
    writer: &mut W,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
) -> Result<(), HandshakeError> {
    let handshake = Handshake::new(*info_hash, *peer_id);
    writer.write_all(&handshake.serialize())?;
    writer.flush()?;
    Ok(())
}

/// Read the peer's handshake and check it belongs to our swarm.
///
/// Returns the remote peer id.
pub fn receive<R: Read>(reader: &mut R, info_hash: &[u8; 20]) -> Result<[u8; 20], HandshakeError> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf)?;

    let remote = Handshake::deserialize(&buf)?;
    if &remote.info_hash != info_hash {
        return Err(HandshakeError::InfoHashMismatch {
            expected: *info_hash,
            received: remote.info_hash,
        });
    }

    Ok(remote.peer_id)
}
