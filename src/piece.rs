//! # BitTorrent Piece Management
//!
//! Pieces are verification units of the torrent data, typically 256KB-1MB in
//! size. They are downloaded in smaller blocks (16KB).
//!
//! ## Block Partitioning
//!
//! `[0, piece_length)` is cut into contiguous blocks of [`BLOCK_SIZE_MAX`]
//! bytes; only the last block of a piece may be shorter.
//!
//! ## Download State Tracking
//!
//! [`PieceWork`] owns the piece buffer while it is being filled and tracks
//! three sets of blocks:
//!
//! - **pending**: not requested yet
//! - **outstanding**: requested, no matching PIECE received
//! - **satisfied**: implicit, everything else
//!
//! A piece is complete when nothing is pending or outstanding. Completion is
//! decided from this bookkeeping, never by scanning the buffer.

use crate::error::UnexpectedPiece;
use crate::message::PieceBlock;

use std::collections::{BTreeMap, VecDeque};

/// Standard block size for piece downloads (16KB)
pub const BLOCK_SIZE_MAX: u32 = 16384;

/// One block of one piece, as sent in a REQUEST message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Zero-based index of the piece
    pub piece_index: u32,
    /// Byte offset of the block within the piece
    pub offset: u32,
    /// Block length in bytes, at most `BLOCK_SIZE_MAX`
    pub length: u32,
}

/// Split a piece into its block requests, in offset order.
///
/// # Arguments
///
/// * `piece_index` - Zero-based piece index.
/// * `piece_length` - Length of that piece in bytes.
///
pub fn blocks(piece_index: u32, piece_length: u32) -> Vec<BlockRequest> {
    let mut blocks = Vec::with_capacity(piece_length.div_ceil(BLOCK_SIZE_MAX) as usize);
    let mut offset = 0;
    while offset < piece_length {
        let length = BLOCK_SIZE_MAX.min(piece_length - offset);
        blocks.push(BlockRequest {
            piece_index,
            offset,
            length,
        });
        offset += length;
    }
    blocks
}

/// Tracks the download state of a single piece on a single session.
#[derive(Debug)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    index: u32,
    /// Buffer receiving block payloads at their offsets
    data: Vec<u8>,
    /// Blocks not requested yet
    pending: VecDeque<BlockRequest>,
    /// Requested blocks keyed by offset
    outstanding: BTreeMap<u32, BlockRequest>,
    /// Bytes copied into `data` so far
    downloaded: u32,
}

impl PieceWork {
    /// Creates the work state for a piece of `length` bytes.
    pub fn new(index: u32, length: u32) -> PieceWork {
        PieceWork {
            index,
            data: vec![0; length as usize],
            pending: blocks(index, length).into(),
            outstanding: BTreeMap::new(),
            downloaded: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Bytes received and copied so far.
    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    /// Number of requests sent and not answered yet.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.outstanding.is_empty()
    }

    /// Take the next block to request, if the window allows one more.
    ///
    /// The returned block moves to the outstanding set.
    pub fn next_request(&mut self, window: usize) -> Option<BlockRequest> {
        if self.outstanding.len() >= window {
            return None;
        }
        let block = self.pending.pop_front()?;
        self.outstanding.insert(block.offset, block);
        Some(block)
    }

    /// Copy a received block into the buffer.
    ///
    /// The block must match an outstanding request exactly (index, offset and
    /// length); anything else is returned as [`UnexpectedPiece`] and leaves the
    /// buffer untouched.
    pub fn accept(&mut self, block: &PieceBlock) -> Result<(), UnexpectedPiece> {
        let unexpected = || UnexpectedPiece {
            piece_index: block.piece_index,
            offset: block.offset,
            length: block.data.len(),
        };

        if block.piece_index != self.index {
            return Err(unexpected());
        }
        match self.outstanding.get(&block.offset) {
            Some(request) if request.length as usize == block.data.len() => {}
            _ => return Err(unexpected()),
        }
        self.outstanding.remove(&block.offset);

        let begin = block.offset as usize;
        self.data[begin..begin + block.data.len()].copy_from_slice(&block.data);
        self.downloaded += block.data.len() as u32;

        Ok(())
    }

    /// Hand the filled buffer over, consuming the work state.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
