//! SHA-1 piece verification.

use crate::metainfo::TorrentDescriptor;

use sha1::{Digest, Sha1};

/// SHA-1 digest of `data`.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// `true` iff `data` hashes to the expected digest of piece `index`.
///
/// An index outside the torrent never verifies.
pub fn verify_piece(descriptor: &TorrentDescriptor, index: u32, data: &[u8]) -> bool {
    match descriptor.piece_hashes.get(index as usize) {
        Some(expected) => {
            let verified = sha1_digest(data) == *expected;
            if verified {
                debug!("Successfully verified integrity of piece {}", index);
            } else {
                warn!("Piece {} failed hash verification", index);
            }
            verified
        }
        None => false,
    }
}
