//! # Peer Worker Thread
//!
//! Each worker owns one peer session and runs on its own thread. It never
//! chooses work: the orchestrator sends it one [`Assignment`] at a time and
//! the worker answers every assignment with exactly one [`Event`].
//!
//! ## Lifecycle
//!
//! 1. **Connection**: connect, handshake, bitfield, interested, unchoke
//! 2. **Ready**: report the peer's bitfield and wait for an assignment
//! 3. **Piece loop**: download the piece block by block, verify its SHA-1
//!    hash, hand it to storage, report completion
//! 4. **Exit**: on the first failed attempt, or when the orchestrator hangs up
//!
//! A worker whose attempt failed closes its session: the peer is presumed
//! unreliable and is never reused for this download.

use crate::bitfield::Bitfield;
use crate::cancel::CancelToken;
use crate::config::DownloadConfig;
use crate::error::{AttemptError, SessionError};
use crate::metainfo::TorrentDescriptor;
use crate::peer::PeerAddress;
use crate::scheduler::download_piece;
use crate::session::PeerSession;
use crate::storage::Storage;
use crate::verify::verify_piece;

use crossbeam_channel::{Receiver, Sender};
use std::io;

/// Identifier the orchestrator gives each worker.
pub type WorkerId = usize;

/// Piece a worker has to download next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub index: u32,
    pub length: u32,
}

/// Messages from workers to the orchestrator.
#[derive(Debug)]
pub enum Event {
    /// The session is unchoked and waiting for work.
    Ready { worker: WorkerId, bitfield: Bitfield },
    /// The piece was verified and stored.
    Completed {
        worker: WorkerId,
        index: u32,
        bytes: u32,
        bitfield: Bitfield,
    },
    /// The attempt failed; the worker has exited.
    Failed {
        worker: WorkerId,
        index: u32,
        error: AttemptError,
    },
    /// The session could not be established; the worker has exited.
    Lost { worker: WorkerId, error: SessionError },
    /// The storage sink refused a verified piece; the worker has exited.
    StorageFailed {
        worker: WorkerId,
        index: u32,
        error: io::Error,
    },
}

/// Downloads assigned pieces from a single peer.
pub struct Worker<'a, S: Storage> {
    id: WorkerId,
    /// Remote peer address
    peer: PeerAddress,
    descriptor: &'a TorrentDescriptor,
    config: &'a DownloadConfig,
    storage: &'a S,
    /// Observed by the session before every read
    cancel: CancelToken,
    /// Work from the orchestrator; closed when the worker is no longer needed
    assignments: Receiver<Assignment>,
    /// Results back to the orchestrator
    events: Sender<Event>,
}

impl<'a, S: Storage> Worker<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        peer: PeerAddress,
        descriptor: &'a TorrentDescriptor,
        config: &'a DownloadConfig,
        storage: &'a S,
        cancel: CancelToken,
        assignments: Receiver<Assignment>,
        events: Sender<Event>,
    ) -> Self {
        Worker {
            id,
            peer,
            descriptor,
            config,
            storage,
            cancel,
            assignments,
            events,
        }
    }

    /// Start worker. Returns when the session is gone.
    pub fn run(self) {
        let mut session = match self.connect() {
            Ok(session) => session,
            Err(error) => {
                debug!("Could not open session with peer {}: {}", self.peer, error);
                let _ = self.events.send(Event::Lost {
                    worker: self.id,
                    error,
                });
                return;
            }
        };

        let ready = Event::Ready {
            worker: self.id,
            bitfield: session.bitfield().clone(),
        };
        if self.events.send(ready).is_err() {
            return;
        }

        // Ends when the orchestrator drops our sender
        for assignment in self.assignments.iter() {
            let event = match self.attempt(&mut session, assignment) {
                Ok(data) => match self.storage.write_piece(assignment.index, &data) {
                    Ok(()) => Event::Completed {
                        worker: self.id,
                        index: assignment.index,
                        bytes: assignment.length,
                        bitfield: session.bitfield().clone(),
                    },
                    Err(error) => Event::StorageFailed {
                        worker: self.id,
                        index: assignment.index,
                        error,
                    },
                },
                Err(error) => Event::Failed {
                    worker: self.id,
                    index: assignment.index,
                    error,
                },
            };

            let completed = matches!(event, Event::Completed { .. });
            if self.events.send(event).is_err() || !completed {
                break;
            }
        }

        session.close();
        debug!("Worker for peer {} exiting", self.peer);
    }

    fn connect(&self) -> Result<PeerSession, SessionError> {
        debug!("Attempting to connect to peer {}", self.peer);

        let mut session = PeerSession::connect(self.peer, self.config.timeout)?
            .with_piece_count(self.descriptor.piece_count())
            .with_cancel(self.cancel.clone());
        session.establish(&self.descriptor.info_hash, &self.config.peer_id)?;

        Ok(session)
    }

    /// Download and verify one piece.
    fn attempt(
        &self,
        session: &mut PeerSession,
        assignment: Assignment,
    ) -> Result<Vec<u8>, AttemptError> {
        let data = download_piece(
            session,
            assignment.index,
            assignment.length,
            self.config.window,
        )?;

        // Verify piece integrity
        if !verify_piece(self.descriptor, assignment.index, &data) {
            return Err(AttemptError::HashMismatch(assignment.index));
        }

        Ok(data)
    }
}
