//! # Download Orchestration
//!
//! The orchestrator is the single owner of the incomplete-piece set and of
//! the piece → worker assignment map. Workers run one per peer session and
//! talk to it only through channels, so no piece is ever handed to two
//! sessions at once.
//!
//! ## Policy
//!
//! - An idle worker gets the lowest-index incomplete piece that no other
//!   worker holds and that its peer advertises.
//! - A worker whose peer has none of the remaining pieces is released.
//! - A failed attempt (transfer error or hash mismatch) puts the piece back,
//!   closes the offending session and opens a replacement from the untried
//!   candidate addresses.
//! - A piece may be retried `retry_budget` times; one more failure is fatal.
//! - When no session is alive and no candidate is left, the download fails.

use crate::bitfield::Bitfield;
use crate::cancel::CancelToken;
use crate::config::DownloadConfig;
use crate::error::{AttemptError, DownloadError};
use crate::metainfo::TorrentDescriptor;
use crate::peer::PeerAddress;
use crate::storage::Storage;
use crate::worker::{Assignment, Event, Worker, WorkerId};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::thread::{self, Scope};
use std::time::Duration;

// How often the orchestrator wakes up to check for cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a successful download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes of verified piece data handed to storage
    pub bytes_downloaded: u64,
    /// Number of pieces downloaded
    pub pieces: usize,
}

/// Download every piece of `descriptor` from `peers` into `storage`.
///
/// # Arguments
///
/// * `descriptor` - The torrent to download.
/// * `peers` - Candidate peer addresses, duplicates are ignored.
/// * `config` - Download knobs.
/// * `storage` - Sink receiving each verified piece once.
///
pub fn download<S: Storage>(
    descriptor: &TorrentDescriptor,
    peers: &[PeerAddress],
    config: &DownloadConfig,
    storage: &S,
) -> Result<DownloadReport, DownloadError> {
    Downloader::new(descriptor, peers.to_vec(), config.clone()).run(storage)
}

/// Configurable download of a torrent, or of some of its pieces.
pub struct Downloader<'a> {
    descriptor: &'a TorrentDescriptor,
    peers: Vec<PeerAddress>,
    config: DownloadConfig,
    pieces: Option<Vec<u32>>,
    cancel: CancelToken,
}

impl<'a> Downloader<'a> {
    pub fn new(
        descriptor: &'a TorrentDescriptor,
        peers: Vec<PeerAddress>,
        config: DownloadConfig,
    ) -> Self {
        Downloader {
            descriptor,
            peers,
            config,
            pieces: None,
            cancel: CancelToken::new(),
        }
    }

    /// Only download these pieces instead of the whole torrent.
    pub fn pieces(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        self.pieces = Some(indices.into_iter().collect());
        self
    }

    /// Abort the download when `cancel` fires.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the download to completion, handing verified pieces to `storage`.
    pub fn run<S: Storage>(&self, storage: &S) -> Result<DownloadReport, DownloadError> {
        let incomplete = self.wanted_pieces()?;
        if incomplete.is_empty() {
            return Ok(DownloadReport {
                bytes_downloaded: 0,
                pieces: 0,
            });
        }

        // Duplicate addresses are ignored
        let mut seen = HashSet::new();
        let candidates: VecDeque<PeerAddress> = self
            .peers
            .iter()
            .copied()
            .filter(|peer| seen.insert(*peer))
            .collect();

        info!(
            "Downloading {:?} ({} pieces) from {} candidate peers",
            self.descriptor.name,
            incomplete.len(),
            candidates.len()
        );

        // Sessions observe this token: fired on user cancellation and once
        // the download is over, whatever the outcome
        let stop = CancelToken::new();
        let (events_tx, events_rx) = unbounded();

        thread::scope(|scope| {
            let mut orchestrator = Orchestrator {
                scope,
                descriptor: self.descriptor,
                config: &self.config,
                storage,
                stop: stop.clone(),
                events_tx,
                workers: BTreeMap::new(),
                next_worker: 0,
                candidates,
                pieces: incomplete.len(),
                incomplete,
                assigned: HashMap::new(),
                attempts: HashMap::new(),
                failures: BTreeMap::new(),
                bytes_downloaded: 0,
                last_error: None,
            };

            let result = orchestrator.drive(&events_rx, &self.cancel);

            // Workers exit once their session or assignment channel is gone
            stop.cancel();
            orchestrator.workers.clear();

            result
        })
    }

    fn wanted_pieces(&self) -> Result<BTreeSet<u32>, DownloadError> {
        let count = self.descriptor.piece_count();
        match &self.pieces {
            None => Ok((0..count).collect()),
            Some(indices) => indices
                .iter()
                .map(|&index| {
                    if index < count {
                        Ok(index)
                    } else {
                        Err(DownloadError::InvalidPiece(index))
                    }
                })
                .collect(),
        }
    }
}

/// Orchestrator view of one running worker.
struct WorkerSlot {
    peer: PeerAddress,
    assignments: Sender<Assignment>,
    /// `None` until the session is established
    bitfield: Option<Bitfield>,
    /// Piece being downloaded, if any
    current: Option<u32>,
}

struct Orchestrator<'scope, 'env, S: Storage> {
    scope: &'scope Scope<'scope, 'env>,
    descriptor: &'env TorrentDescriptor,
    config: &'env DownloadConfig,
    storage: &'env S,
    stop: CancelToken,
    events_tx: Sender<Event>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    next_worker: WorkerId,
    /// Untried peer addresses
    candidates: VecDeque<PeerAddress>,
    /// Number of pieces this download was asked for
    pieces: usize,
    incomplete: BTreeSet<u32>,
    /// Piece index → worker holding it
    assigned: HashMap<u32, WorkerId>,
    /// Failed attempts per piece
    attempts: HashMap<u32, u32>,
    /// Last failure per piece
    failures: BTreeMap<u32, AttemptError>,
    bytes_downloaded: u64,
    last_error: Option<String>,
}

impl<'scope, 'env, S: Storage> Orchestrator<'scope, 'env, S>
where
    'env: 'scope,
{
    fn drive(
        &mut self,
        events: &Receiver<Event>,
        cancel: &CancelToken,
    ) -> Result<DownloadReport, DownloadError> {
        self.open_sessions();

        loop {
            if self.incomplete.is_empty() {
                info!(
                    "Download complete: {} pieces, {} bytes",
                    self.pieces, self.bytes_downloaded
                );
                return Ok(DownloadReport {
                    bytes_downloaded: self.bytes_downloaded,
                    pieces: self.pieces,
                });
            }
            if cancel.is_cancelled() {
                warn!("Download cancelled");
                self.stop.cancel();
                return Err(DownloadError::Cancelled);
            }
            if self.workers.is_empty() && self.candidates.is_empty() {
                return Err(self.stalled());
            }

            match events.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(event) => self.handle(event)?,
                Err(RecvTimeoutError::Timeout) => continue,
                // Unreachable while we hold a sender
                Err(RecvTimeoutError::Disconnected) => return Err(self.stalled()),
            }

            self.dispatch();
            self.open_sessions();
        }
    }

    fn handle(&mut self, event: Event) -> Result<(), DownloadError> {
        match event {
            Event::Ready { worker, bitfield } => {
                if let Some(slot) = self.workers.get_mut(&worker) {
                    info!("Session with peer {} ready", slot.peer);
                    slot.bitfield = Some(bitfield);
                }
            }
            Event::Completed {
                worker,
                index,
                bytes,
                bitfield,
            } => {
                self.assigned.remove(&index);
                self.failures.remove(&index);
                if self.incomplete.remove(&index) {
                    self.bytes_downloaded += bytes as u64;
                }
                if let Some(slot) = self.workers.get_mut(&worker) {
                    slot.current = None;
                    slot.bitfield = Some(bitfield);
                }
                debug!(
                    "Piece {} complete, {} remaining",
                    index,
                    self.incomplete.len()
                );
            }
            Event::Failed {
                worker,
                index,
                error,
            } => {
                self.assigned.remove(&index);
                if let Some(slot) = self.workers.remove(&worker) {
                    warn!(
                        "Piece {} failed on peer {}, closing session: {}",
                        index, slot.peer, error
                    );
                }
                self.last_error = Some(error.to_string());

                let attempts = self.attempts.entry(index).or_insert(0);
                *attempts += 1;
                if *attempts > self.config.retry_budget {
                    return Err(DownloadError::PieceUnrecoverable {
                        index,
                        attempts: *attempts,
                        cause: error,
                    });
                }

                info!("Requeue piece {} (attempt {} failed)", index, attempts);
                self.failures.insert(index, error);
            }
            Event::Lost { worker, error } => {
                if let Some(slot) = self.workers.remove(&worker) {
                    debug!("Lost peer {}: {}", slot.peer, error);
                }
                self.last_error = Some(error.to_string());
            }
            Event::StorageFailed {
                worker,
                index,
                error,
            } => {
                self.workers.remove(&worker);
                error!("Could not store piece {}: {}", index, error);
                return Err(DownloadError::Storage {
                    index,
                    source: error,
                });
            }
        }
        Ok(())
    }

    /// Give every idle, ready worker its next piece, releasing the ones
    /// whose peer cannot help anymore.
    fn dispatch(&mut self) {
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.bitfield.is_some() && slot.current.is_none())
            .map(|(&id, _)| id)
            .collect();

        for id in idle {
            self.assign(id);
        }
    }

    fn assign(&mut self, id: WorkerId) {
        let Some(slot) = self.workers.get(&id) else {
            return;
        };
        let Some(bitfield) = &slot.bitfield else {
            return;
        };

        let next = self
            .incomplete
            .iter()
            .copied()
            .find(|index| !self.assigned.contains_key(index) && bitfield.has_piece(*index));

        let Some(index) = next else {
            if !self.incomplete.iter().any(|&index| bitfield.has_piece(index)) {
                info!(
                    "Peer {} has none of the remaining pieces, releasing it",
                    slot.peer
                );
                self.workers.remove(&id);
            }
            return;
        };

        let Some(length) = self.descriptor.piece_length(index) else {
            return;
        };
        let assignment = Assignment { index, length };
        if slot.assignments.send(assignment).is_err() {
            self.workers.remove(&id);
            return;
        }

        debug!("Assign piece {} to peer {}", index, slot.peer);
        self.assigned.insert(index, id);
        if let Some(slot) = self.workers.get_mut(&id) {
            slot.current = Some(index);
        }
    }

    /// Start sessions against untried candidates, up to `max_sessions`.
    fn open_sessions(&mut self) {
        while self.workers.len() < self.config.max_sessions.max(1) {
            let Some(peer) = self.candidates.pop_front() else {
                break;
            };

            let id = self.next_worker;
            self.next_worker += 1;

            let (assignments_tx, assignments_rx) = unbounded();
            let worker = Worker::new(
                id,
                peer,
                self.descriptor,
                self.config,
                self.storage,
                self.stop.clone(),
                assignments_rx,
                self.events_tx.clone(),
            );
            self.scope.spawn(move || worker.run());

            debug!("Opened session {} with peer {}", id, peer);
            self.workers.insert(
                id,
                WorkerSlot {
                    peer,
                    assignments: assignments_tx,
                    bitfield: None,
                    current: None,
                },
            );
        }
    }

    /// Terminal error once no session can make progress.
    fn stalled(&mut self) -> DownloadError {
        if let Some((index, cause)) = self.failures.pop_first() {
            let attempts = self.attempts.get(&index).copied().unwrap_or(1);
            return DownloadError::PieceUnrecoverable {
                index,
                attempts,
                cause,
            };
        }

        DownloadError::NoPeersLeft {
            remaining: self.incomplete.len(),
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "no candidate peers".to_string()),
        }
    }
}
