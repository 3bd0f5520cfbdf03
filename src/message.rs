//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message framing of the BitTorrent peer wire
//! protocol and the typed payloads this client interprets.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! A keep-alive message has length 0 and no ID or payload.
//!
//! ## Message Types
//!
//! | ID | Name | Description |
//! |----|------|-------------|
//! | 0 | CHOKE | Peer will not send pieces (no payload) |
//! | 1 | UNCHOKE | Peer will send pieces (no payload) |
//! | 2 | INTERESTED | Client wants to download (no payload) |
//! | 3 | NOT INTERESTED | Client doesn't want to download (no payload) |
//! | 4 | HAVE | Peer has a piece (payload: piece index) |
//! | 5 | BITFIELD | Peer's piece availability (payload: bitfield) |
//! | 6 | REQUEST | Request a block (payload: index, begin, length) |
//! | 7 | PIECE | Block data (payload: index, begin, data) |
//! | 8 | CANCEL | Cancel a request (payload: index, begin, length) |
//!
//! The codec itself never looks inside a payload; [`BlockRequest`] and
//! [`PieceBlock`] do that for the two messages whose layout matters here.

use crate::error::FramingError;
use crate::piece::BlockRequest;

use byteorder::{BigEndian, ByteOrder};
use std::io::{self, Read, Write};

pub type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// Pseudo id used in logs and errors for a zero-length keep-alive frame.
pub const MESSAGE_KEEPALIVE: MessageId = 255;

/// Largest length prefix accepted from a peer (1 MiB).
///
/// Blocks are at most 16 KiB and a bitfield for a million pieces is 128 KiB,
/// so anything above this is a broken or hostile peer.
pub const MAX_MESSAGE_LENGTH: u32 = 1 << 20;

/// Size of the `index` + `begin` header in front of a PIECE block.
const PIECE_HEADER_LEN: usize = 8;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message.
    ///
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message as `length || id || payload`.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = vec![0; 4];
        BigEndian::write_u32(&mut serialized, message_len as u32);
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        serialized
    }

    /// Human readable name, for logs.
    pub fn name(&self) -> &'static str {
        message_name(self.id)
    }
}

pub fn message_name(id: MessageId) -> &'static str {
    match id {
        MESSAGE_CHOKE => "CHOKE",
        MESSAGE_UNCHOKE => "UNCHOKE",
        MESSAGE_INTERESTED => "INTERESTED",
        MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
        MESSAGE_HAVE => "HAVE",
        MESSAGE_BITFIELD => "BITFIELD",
        MESSAGE_REQUEST => "REQUEST",
        MESSAGE_PIECE => "PIECE",
        MESSAGE_CANCEL => "CANCEL",
        MESSAGE_KEEPALIVE => "KEEP_ALIVE",
        _ => "UNKNOWN",
    }
}

/// Serialized keep-alive frame.
pub fn keep_alive() -> [u8; 4] {
    [0; 4]
}

/// Write one message to a stream.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), FramingError> {
    writer.write_all(&message.serialize())?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one message from a stream.
///
/// Returns `Ok(None)` for a keep-alive.
///
/// # Errors
///
/// - [`FramingError::Closed`] if the stream ends before a length prefix.
/// - [`FramingError::Truncated`] if it ends inside a message.
/// - [`FramingError::TooLong`] if the declared length exceeds [`MAX_MESSAGE_LENGTH`].
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, FramingError> {
    let mut prefix = [0u8; 4];
    match read_full(reader, &mut prefix) {
        Err(FramingError::Truncated { read: 0, .. }) => return Err(FramingError::Closed),
        result => result?,
    }
    let message_len = BigEndian::read_u32(&prefix);

    // Keep-alive
    if message_len == 0 {
        return Ok(None);
    }

    if message_len > MAX_MESSAGE_LENGTH {
        return Err(FramingError::TooLong {
            length: message_len,
            max: MAX_MESSAGE_LENGTH,
        });
    }

    let mut message_buf: Vec<u8> = vec![0; message_len as usize];
    read_full(reader, &mut message_buf)?;

    let id: MessageId = message_buf[0];
    let payload: MessagePayload = message_buf.split_off(1);

    Ok(Some(Message::new_with_payload(id, payload)))
}

/// Like `read_exact`, but reports how much arrived before the stream ended.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FramingError> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(FramingError::Truncated {
                    expected: buf.len(),
                    read,
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl BlockRequest {
    /// Build the REQUEST message asking for this block.
    ///
    /// ```text
    /// <len=0013><id=6><index: u32><begin: u32><length: u32>
    /// ```
    pub fn to_message(&self) -> Message {
        let mut payload = vec![0; 12];
        BigEndian::write_u32(&mut payload[0..4], self.piece_index);
        BigEndian::write_u32(&mut payload[4..8], self.offset);
        BigEndian::write_u32(&mut payload[8..12], self.length);
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Parse the payload of a REQUEST message.
    pub fn from_message(message: &Message) -> Result<BlockRequest, FramingError> {
        if message.id != MESSAGE_REQUEST || message.payload.len() != 12 {
            return Err(FramingError::Malformed {
                id: message.id,
                reason: "request payload must be 12 bytes",
            });
        }
        let payload = &message.payload;
        Ok(BlockRequest {
            piece_index: BigEndian::read_u32(&payload[0..4]),
            offset: BigEndian::read_u32(&payload[4..8]),
            length: BigEndian::read_u32(&payload[8..12]),
        })
    }
}

/// Block data carried by a PIECE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub piece_index: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl PieceBlock {
    /// Build the PIECE message carrying this block.
    ///
    /// ```text
    /// <len><id=7><index: u32><begin: u32><block: [u8]>
    /// ```
    pub fn to_message(&self) -> Message {
        let mut payload = vec![0; PIECE_HEADER_LEN];
        BigEndian::write_u32(&mut payload[0..4], self.piece_index);
        BigEndian::write_u32(&mut payload[4..8], self.offset);
        payload.extend_from_slice(&self.data);
        Message::new_with_payload(MESSAGE_PIECE, payload)
    }

    /// Parse a PIECE message, taking ownership of its payload.
    pub fn from_message(message: Message) -> Result<PieceBlock, FramingError> {
        if message.id != MESSAGE_PIECE || message.payload.len() < PIECE_HEADER_LEN {
            return Err(FramingError::Malformed {
                id: message.id,
                reason: "piece payload shorter than its 8-byte header",
            });
        }
        let mut payload = message.payload;
        let data = payload.split_off(PIECE_HEADER_LEN);
        Ok(PieceBlock {
            piece_index: BigEndian::read_u32(&payload[0..4]),
            offset: BigEndian::read_u32(&payload[4..8]),
            data,
        })
    }
}

/// Parse the piece index of a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32, FramingError> {
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(FramingError::Malformed {
            id: message.id,
            reason: "have payload must be 4 bytes",
        });
    }
    Ok(BigEndian::read_u32(&message.payload))
}
