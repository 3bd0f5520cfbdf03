//! # Block Scheduler
//!
//! Downloads one piece over one unchoked session: keeps up to `window`
//! block requests in flight, collects PIECE messages into the piece buffer
//! and stops once every block has been satisfied.
//!
//! While the peer chokes us no new requests are sent; the loop keeps reading
//! until an UNCHOKE arrives or the session times out.
//!
//! When the session has a timeout, it bounds the time between two accepted
//! blocks. Chokes, keep-alives, HAVEs and discarded blocks do not reset it.

use crate::error::{SessionError, TransferError};
use crate::piece::PieceWork;
use crate::session::{Connection, Incoming, PeerSession};

use std::time::Instant;

/// Download piece `piece_index` of `piece_length` bytes.
///
/// Returns the assembled (not yet verified) piece buffer.
///
/// # Arguments
///
/// * `session` - An established session, `Unchoked` or `Transferring`.
/// * `piece_index` - Zero-based index of the piece.
/// * `piece_length` - Exact length of that piece.
/// * `window` - Maximum number of outstanding block requests.
///
pub fn download_piece<C: Connection>(
    session: &mut PeerSession<C>,
    piece_index: u32,
    piece_length: u32,
    window: usize,
) -> Result<Vec<u8>, TransferError> {
    let mut work = PieceWork::new(piece_index, piece_length);
    let window = window.max(1);
    let mut deadline = progress_deadline(session);

    while !work.is_complete() {
        // Fill the pipeline
        if !session.is_choked() {
            while let Some(request) = work.next_request(window) {
                if let Err(e) = session.send_request(&request) {
                    return Err(transfer_error(&work, e));
                }
            }
        }

        match session.receive_before(deadline) {
            Ok(Incoming::Block(block)) => match work.accept(&block) {
                Ok(()) => deadline = progress_deadline(session),
                Err(unexpected) => warn!(
                    "Discarding block from peer {}: {}",
                    session.peer(),
                    unexpected
                ),
            },
            Ok(Incoming::Choke) | Ok(Incoming::Unchoke) => {}
            Err(e) => return Err(transfer_error(&work, e)),
        }
    }

    info!(
        "Successfully downloaded piece {} from peer {}",
        piece_index,
        session.peer()
    );

    Ok(work.into_data())
}

/// Latest time the next accepted block may arrive.
fn progress_deadline<C: Connection>(session: &PeerSession<C>) -> Option<Instant> {
    session.timeout().map(|timeout| Instant::now() + timeout)
}

fn transfer_error(work: &PieceWork, source: SessionError) -> TransferError {
    TransferError {
        piece_index: work.index(),
        received: work.downloaded(),
        source,
    }
}
