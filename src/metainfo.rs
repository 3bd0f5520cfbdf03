//! # Torrent Metainfo
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tiers of tracker URLs
//! - **info**: Dictionary with file information and piece hashes
//!   - **pieces**: Concatenated SHA-1 hashes for integrity verification
//!   - **piece length**: Size of each piece (typically 256KB-1MB)
//!   - **length**: Total file size
//!   - **name**: Suggested filename
//!
//! ## Info Hash
//!
//! The info dictionary is first decoded as an untyped bencode value and
//! re-encoded (dictionary keys sorted) before hashing, so keys this client
//! does not know about still contribute to the info hash. Only then is it
//! converted into the typed [`TorrentDescriptor`].

use crate::error::MetainfoError;
use crate::verify::sha1_digest;

use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use std::fs;
use std::path::Path;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// BencodeTorrent structure.
#[derive(Deserialize)]
struct BencodeTorrent {
    // URL of the tracker
    #[serde(default)]
    announce: Option<String>,
    // Tiers of tracker URLs
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Informations about file, kept untyped for hashing
    info: Value,
}

/// BencodeInfo structure.
#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes, absent for multi-file torrents
    #[serde(default)]
    length: Option<u64>,
    // Suggested filename where to save the file
    name: String,
}

/// Immutable description of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    /// Suggested filename
    pub name: String,
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    pub trackers: Vec<Vec<String>>,
    /// Total size of the file in bytes
    pub total_length: u64,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// One 20-byte SHA-1 hash per piece, in piece order
    pub piece_hashes: Vec<[u8; 20]>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
}

impl TorrentDescriptor {
    /// Build a descriptor from already known fields.
    ///
    /// # Errors
    ///
    /// Fails unless `piece_length` and `total_length` are positive and there
    /// is exactly one hash per piece.
    pub fn new(
        name: String,
        trackers: Vec<Vec<String>>,
        total_length: u64,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: [u8; 20],
    ) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::ZeroPieceLength);
        }
        if total_length == 0 {
            return Err(MetainfoError::ZeroLength);
        }
        let expected = total_length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected || expected > u32::MAX as u64 {
            return Err(MetainfoError::PieceCountMismatch {
                hashes: piece_hashes.len(),
                expected,
            });
        }

        Ok(TorrentDescriptor {
            name,
            trackers,
            total_length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    /// Parse the content of a `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let bencode = de::from_bytes::<BencodeTorrent>(buf)?;

        // Hash the info dictionary exactly as it will be re-encoded
        let info_bytes = ser::to_bytes(&bencode.info)?;
        let info_hash = sha1_digest(&info_bytes);
        let info = de::from_bytes::<BencodeInfo>(&info_bytes)?;

        let trackers = if !bencode.announce_list.is_empty() {
            bencode.announce_list
        } else if let Some(announce) = bencode.announce.filter(|a| !a.is_empty()) {
            vec![vec![announce]]
        } else {
            vec![]
        };

        let total_length = info.length.ok_or(MetainfoError::MultiFile)?;
        let piece_hashes = split_pieces_hashes(&info.pieces)?;

        TorrentDescriptor::new(
            info.name,
            trackers,
            total_length,
            info.piece_length,
            piece_hashes,
            info_hash,
        )
    }

    /// Open and parse a `.torrent` file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the torrent.
    ///
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MetainfoError> {
        let buf = fs::read(path)?;
        Self::from_bytes(&buf)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`: `piece_length`, except for the last piece
    /// which holds whatever remains. `None` outside the torrent.
    pub fn piece_length(&self, index: u32) -> Option<u32> {
        let count = self.piece_count();
        if index >= count {
            return None;
        }
        if index + 1 < count {
            return Some(self.piece_length);
        }
        let before_last = self.piece_length as u64 * (count as u64 - 1);
        Some((self.total_length - before_last) as u32)
    }

    /// Byte offset of piece `index` in the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Unique tracker URLs across all tiers, in tier order.
    pub fn tracker_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::new();
        for url in self.trackers.iter().flatten() {
            if !urls.contains(&url.as_str()) {
                urls.push(url);
            }
        }
        urls
    }
}

/// Split bencoded pieces into 20-byte SHA-1 hashes.
fn split_pieces_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, MetainfoError> {
    // Check torrent pieces
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(MetainfoError::InvalidPieces(pieces.len()));
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}
