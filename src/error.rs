//! # Error Taxonomy
//!
//! Errors are layered the same way the download is:
//!
//! - **Framing / handshake / sequence errors** end a single peer session.
//! - **Transfer errors and hash mismatches** end one piece attempt; the piece
//!   goes back to the queue and the session is dropped.
//! - **Exhaustion errors** end the whole download and are the only ones a
//!   caller of [`crate::download`] ever sees.

use crate::session::SessionState;

use std::io;
use thiserror::Error;

/// Failure to read or write one length-prefixed wire message.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The peer closed the connection before a new message started.
    #[error("connection closed by peer")]
    Closed,

    /// The peer closed the connection in the middle of a message.
    #[error("connection closed mid-message ({read} of {expected} bytes)")]
    Truncated { expected: usize, read: usize },

    /// The declared length is larger than anything a sane peer would send.
    #[error("declared message length {length} exceeds limit {max}")]
    TooLong { length: u32, max: u32 },

    /// A message payload does not have the shape its id requires.
    #[error("malformed message {id}: {reason}")]
    Malformed { id: u8, reason: &'static str },

    /// Read or write did not complete within the configured timeout.
    #[error("timed out waiting for peer")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FramingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => FramingError::Timeout,
            io::ErrorKind::UnexpectedEof => FramingError::Closed,
            _ => FramingError::Io(err),
        }
    }
}

/// Failure of the fixed 68-byte handshake exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Protocol-name length or literal is not "BitTorrent protocol".
    #[error("peer does not speak the BitTorrent protocol")]
    ProtocolMismatch,

    /// The peer answered for another swarm.
    #[error("info hash mismatch: expected {}, received {}", hex::encode(.expected), hex::encode(.received))]
    InfoHashMismatch {
        expected: [u8; 20],
        received: [u8; 20],
    },

    #[error("timed out during handshake")]
    Timeout,

    /// Short read or any other transport failure.
    #[error("handshake failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HandshakeError::Timeout,
            _ => HandshakeError::Io(err),
        }
    }
}

/// Anything that makes a peer session unusable.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to peer: {0}")]
    Connect(#[source] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A message arrived that the state machine does not allow in `state`.
    #[error("unexpected message {id} while {state:?}")]
    UnexpectedMessage { state: SessionState, id: u8 },

    /// A local caller tried an operation the current state does not allow.
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("session is closed")]
    Closed,

    #[error("download cancelled")]
    Cancelled,
}

/// A PIECE message that matches no outstanding request. Never fatal: the
/// block is dropped and the scheduler keeps waiting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected block for piece {piece_index} at offset {offset} ({length} bytes)")]
pub struct UnexpectedPiece {
    pub piece_index: u32,
    pub offset: u32,
    pub length: usize,
}

/// A piece attempt aborted because the session failed underneath it.
#[derive(Debug, Error)]
#[error("transfer of piece {piece_index} failed after {received} bytes: {source}")]
pub struct TransferError {
    pub piece_index: u32,
    /// Bytes of this piece already received when the session failed.
    pub received: u32,
    #[source]
    pub source: SessionError,
}

/// Why a single piece attempt on a single session did not produce a piece.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("piece {0} failed hash verification")]
    HashMismatch(u32),
}

/// Terminal failure of a whole download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// A piece used up its retry budget, or every peer that could serve it is gone.
    #[error("piece {index} could not be downloaded after {attempts} attempts: {cause}")]
    PieceUnrecoverable {
        index: u32,
        attempts: u32,
        #[source]
        cause: AttemptError,
    },

    /// No candidate peers are left and nothing has failed that could be blamed.
    #[error("no peers left with {remaining} pieces remaining (last error: {last_error})")]
    NoPeersLeft { remaining: usize, last_error: String },

    #[error("could not write piece {index} to storage: {source}")]
    Storage {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("requested piece {0} is out of range")]
    InvalidPiece(u32),

    #[error("download cancelled")]
    Cancelled,
}

/// Failure to turn bencoded bytes into a `TorrentDescriptor`.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("could not read torrent file: {0}")]
    Io(#[from] io::Error),

    #[error("could not decode bencode: {0}")]
    Decode(#[from] serde_bencode::Error),

    #[error("pieces field length {0} is not a multiple of 20")]
    InvalidPieces(usize),

    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("total length must be greater than zero")]
    ZeroLength,

    #[error("multi-file torrents are not supported")]
    MultiFile,

    #[error("torrent has {hashes} piece hashes but its length requires {expected}")]
    PieceCountMismatch { hashes: usize, expected: u64 },
}

/// Failure to obtain peers from the tracker(s).
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("could not parse tracker url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not decode tracker response: {0}")]
    Decode(#[from] serde_bencode::Error),

    #[error("tracker refused announce: {0}")]
    Failure(String),

    #[error("compact peer list length {0} is not a multiple of 6")]
    InvalidPeers(usize),

    #[error("torrent has no announce or announce-list")]
    NoTracker,

    #[error("could not get peers from any tracker")]
    NoPeers,
}
