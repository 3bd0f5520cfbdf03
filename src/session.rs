//! # BitTorrent Peer Session
//!
//! This module implements the client side of the peer wire protocol for a
//! single connection: handshake, bitfield, interest and choke management, and
//! the request/piece exchange used by the block scheduler.
//!
//! ## State Machine
//!
//! Transitions are strict; no state can be skipped:
//!
//! ```text
//! Connected --send handshake--> HandshakeSent --valid reply--> HandshakeVerified
//!   --await first message--> AwaitingBitfield --BITFIELD--> BitfieldReceived
//!   --send INTERESTED--> InterestedSent --UNCHOKE--> Unchoked
//!   --first REQUEST--> Transferring --close--> Closed
//! ```
//!
//! While `AwaitingBitfield` only a BITFIELD is accepted and while
//! `InterestedSent` only an UNCHOKE; anything else, keep-alives and HAVEs
//! included, is a protocol violation that closes the session. Once unchoked,
//! CHOKE, UNCHOKE, HAVE and keep-alive are accepted at any time, and PIECE is
//! accepted once requests have been sent.
//!
//! HAVE indices are bounded by the torrent's piece count (or, when the session
//! was not told it, by the advertised BITFIELD); an index outside that range
//! is a malformed message.
//!
//! ## Progress
//!
//! A session with a timeout also bounds how long [`PeerSession::receive_before`]
//! keeps skipping keep-alives and HAVEs: a peer that stays chatty without ever
//! delivering data still times out.
//!
//! ## Ownership
//!
//! A session exclusively owns its connection. Every error closes it; closing
//! is idempotent and also happens on drop.

use crate::bitfield::Bitfield;
use crate::cancel::CancelToken;
use crate::error::{FramingError, SessionError};
use crate::handshake;
use crate::message::*;
use crate::peer::PeerAddress;
use crate::piece::BlockRequest;

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

/// Transport a session runs on.
pub trait Connection: Read + Write + Send {
    /// Bound every subsequent read and write.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    HandshakeSent,
    HandshakeVerified,
    AwaitingBitfield,
    BitfieldReceived,
    InterestedSent,
    Unchoked,
    Transferring,
    Closed,
}

impl SessionState {
    pub const ALL: [SessionState; 9] = [
        SessionState::Connected,
        SessionState::HandshakeSent,
        SessionState::HandshakeVerified,
        SessionState::AwaitingBitfield,
        SessionState::BitfieldReceived,
        SessionState::InterestedSent,
        SessionState::Unchoked,
        SessionState::Transferring,
        SessionState::Closed,
    ];

    /// State reached by receiving message `id` in this state, `None` if the
    /// message is not allowed here.
    pub fn on_message(self, id: MessageId) -> Option<SessionState> {
        use SessionState::*;

        match (self, id) {
            (AwaitingBitfield, MESSAGE_BITFIELD) => Some(BitfieldReceived),
            (InterestedSent, MESSAGE_UNCHOKE) => Some(Unchoked),
            (Transferring, MESSAGE_PIECE) => Some(Transferring),
            (Unchoked | Transferring, MESSAGE_CHOKE | MESSAGE_UNCHOKE | MESSAGE_HAVE) => Some(self),
            _ => None,
        }
    }

    /// Whether a keep-alive is tolerated in this state.
    pub fn accepts_keep_alive(self) -> bool {
        matches!(self, SessionState::Unchoked | SessionState::Transferring)
    }
}

/// What the block scheduler gets back from [`PeerSession::receive_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Block(PieceBlock),
    Choke,
    Unchoke,
}

/// One connection to a remote peer.
pub struct PeerSession<C: Connection = TcpStream> {
    /// Remote address, for logs
    peer: PeerAddress,
    /// `None` once closed
    conn: Option<C>,
    state: SessionState,
    /// Peer id received in the handshake
    remote_peer_id: Option<[u8; 20]>,
    /// Pieces the peer advertised (BITFIELD, then HAVEs)
    bitfield: Bitfield,
    /// Whether the peer currently chokes us
    choked: bool,
    /// Number of pieces in the torrent, bounds BITFIELD and HAVE
    piece_count: Option<u32>,
    /// Longest wait for a useful message
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl PeerSession<TcpStream> {
    /// Open a TCP connection to `peer`, bounding the connect and every later
    /// read and write by `timeout`.
    pub fn connect(peer: PeerAddress, timeout: Duration) -> Result<Self, SessionError> {
        let conn = TcpStream::connect_timeout(&peer.socket_addr(), timeout)
            .map_err(SessionError::Connect)?;
        conn.set_timeout(Some(timeout)).map_err(SessionError::Connect)?;

        info!("Connected to peer {}", peer);

        Ok(PeerSession::new(peer, conn).with_timeout(timeout))
    }
}

impl<C: Connection> PeerSession<C> {
    /// Wrap an already established connection. The session starts `Connected`.
    pub fn new(peer: PeerAddress, conn: C) -> Self {
        PeerSession {
            peer,
            conn: Some(conn),
            state: SessionState::Connected,
            remote_peer_id: None,
            bitfield: Bitfield::default(),
            choked: true,
            piece_count: None,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }

    /// Bound BITFIELD length and HAVE indices by the torrent's piece count.
    pub fn with_piece_count(mut self, piece_count: u32) -> Self {
        self.piece_count = Some(piece_count);
        self
    }

    /// Give up when the peer sends nothing useful for `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Observe `cancel` before every read.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Whether the peer currently refuses requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Run the whole opening sequence: handshake, bitfield, interested, unchoke.
    ///
    /// Returns the remote peer id.
    pub fn establish(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<[u8; 20], SessionError> {
        let remote_peer_id = self.handshake(info_hash, peer_id)?;
        self.await_bitfield()?;
        self.send_interested()?;
        self.await_unchoke()?;
        Ok(remote_peer_id)
    }

    /// Exchange handshakes and verify the peer belongs to our swarm.
    ///
    /// Returns the remote peer id.
    pub fn handshake(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<[u8; 20], SessionError> {
        self.expect_state(&[SessionState::Connected], "send handshake")?;

        self.with_conn(|conn| handshake::send(conn, info_hash, peer_id))?;
        self.state = SessionState::HandshakeSent;
        debug!("Send HANDSHAKE to peer {}", self.peer);

        let remote_peer_id = self.with_conn(|conn| handshake::receive(conn, info_hash))?;
        self.remote_peer_id = Some(remote_peer_id);
        self.state = SessionState::HandshakeVerified;

        info!(
            "Handshake with peer {} verified (peer id {})",
            self.peer,
            hex::encode(remote_peer_id)
        );

        Ok(remote_peer_id)
    }

    /// Wait for the peer's BITFIELD, which must be its first message.
    pub fn await_bitfield(&mut self) -> Result<&Bitfield, SessionError> {
        self.expect_state(&[SessionState::HandshakeVerified], "await bitfield")?;
        self.state = SessionState::AwaitingBitfield;

        let frame = self.read_frame()?;
        self.advance(&frame)?;
        if let Some(message) = frame {
            let mut bytes = message.payload;
            if let Some(count) = self.piece_count {
                bytes.truncate(count.div_ceil(8) as usize);
            }
            self.bitfield = Bitfield::from_bytes(bytes);
        }

        Ok(&self.bitfield)
    }

    /// Tell the peer we want to download.
    pub fn send_interested(&mut self) -> Result<(), SessionError> {
        self.expect_state(&[SessionState::BitfieldReceived], "send interested")?;

        self.send(Message::new(MESSAGE_INTERESTED))?;
        self.state = SessionState::InterestedSent;

        Ok(())
    }

    /// Wait for the peer to unchoke us, which must be its next message.
    pub fn await_unchoke(&mut self) -> Result<(), SessionError> {
        self.expect_state(&[SessionState::InterestedSent], "await unchoke")?;

        let frame = self.read_frame()?;
        self.advance(&frame)?;
        self.choked = false;

        Ok(())
    }

    /// Request one block. The first request moves the session to `Transferring`.
    pub fn send_request(&mut self, request: &BlockRequest) -> Result<(), SessionError> {
        self.expect_state(
            &[SessionState::Unchoked, SessionState::Transferring],
            "send request",
        )?;
        if self.choked {
            return Err(SessionError::InvalidState {
                action: "send request while choked",
                state: self.state,
            });
        }

        debug!(
            "Send REQUEST for piece {} [{}:{}] to peer {}",
            request.piece_index,
            request.offset,
            request.offset + request.length,
            self.peer
        );
        self.send(request.to_message())?;
        self.state = SessionState::Transferring;

        Ok(())
    }

    /// Block until the next message the scheduler cares about.
    ///
    /// HAVEs update the bitfield and keep-alives are skipped; both keep the
    /// loop going.
    pub fn receive_next(&mut self) -> Result<Incoming, SessionError> {
        self.receive_before(None)
    }

    /// Like [`receive_next`](Self::receive_next), but fails with a timeout
    /// once `deadline` passes, however many keep-alives and HAVEs arrived.
    pub fn receive_before(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Incoming, SessionError> {
        loop {
            self.expect_state(
                &[SessionState::Unchoked, SessionState::Transferring],
                "receive",
            )?;
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Peer {} sent nothing useful in time", self.peer);
                return Err(self.fail(FramingError::Timeout.into()));
            }

            let frame = self.read_frame()?;
            self.advance(&frame)?;
            let Some(message) = frame else {
                continue;
            };

            match message.id {
                MESSAGE_PIECE => {
                    let block =
                        PieceBlock::from_message(message).map_err(|e| self.fail(e.into()))?;
                    return Ok(Incoming::Block(block));
                }
                MESSAGE_CHOKE => {
                    warn!("Peer {} choked us, waiting for unchoke", self.peer);
                    self.choked = true;
                    return Ok(Incoming::Choke);
                }
                MESSAGE_UNCHOKE => {
                    info!("Peer {} unchoked us", self.peer);
                    self.choked = false;
                    return Ok(Incoming::Unchoke);
                }
                MESSAGE_HAVE => {
                    let index = parse_have(&message).map_err(|e| self.fail(e.into()))?;
                    let limit = match self.piece_count {
                        Some(count) => count as u64,
                        None => self.bitfield.as_bytes().len() as u64 * 8,
                    };
                    if index as u64 >= limit {
                        let error = FramingError::Malformed {
                            id: MESSAGE_HAVE,
                            reason: "have index beyond the torrent",
                        };
                        return Err(self.fail(error.into()));
                    }
                    self.bitfield.set_piece(index);
                }
                id => {
                    let state = self.state;
                    return Err(self.fail(SessionError::UnexpectedMessage { state, id }));
                }
            }
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.shutdown() {
                debug!("Error shutting down connection to {}: {}", self.peer, e);
            }
            info!("Closed session with peer {}", self.peer);
        }
        self.state = SessionState::Closed;
    }

    /// Close the session and hand the error back.
    fn fail(&mut self, error: SessionError) -> SessionError {
        debug!("Session with peer {} failed: {}", self.peer, error);
        self.close();
        error
    }

    fn expect_state(
        &self,
        allowed: &[SessionState],
        action: &'static str,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if !allowed.contains(&self.state) {
            return Err(SessionError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Run a transport operation, closing the session if it fails.
    fn with_conn<T, E>(
        &mut self,
        op: impl FnOnce(&mut C) -> Result<T, E>,
    ) -> Result<T, SessionError>
    where
        E: Into<SessionError>,
    {
        let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn send(&mut self, message: Message) -> Result<(), SessionError> {
        self.with_conn(|conn| write_message(conn, &message))?;
        debug!("Send {} to peer {}", message.name(), self.peer);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Message>, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(SessionError::Cancelled));
        }

        let frame = self.with_conn(|conn| read_message(conn))?;
        match &frame {
            Some(message) => debug!(
                "Receive {} ({} bytes) from peer {}",
                message.name(),
                message.payload.len(),
                self.peer
            ),
            None => debug!("Receive KEEP_ALIVE from peer {}", self.peer),
        }

        Ok(frame)
    }

    /// Apply the transition table to a received frame.
    fn advance(&mut self, frame: &Option<Message>) -> Result<(), SessionError> {
        let next = match frame {
            Some(message) => self.state.on_message(message.id),
            None => self.state.accepts_keep_alive().then_some(self.state),
        };

        match next {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => {
                let state = self.state;
                let id = frame.as_ref().map_or(MESSAGE_KEEPALIVE, |m| m.id);
                warn!(
                    "Unexpected {} from peer {} while {:?}",
                    message_name(id),
                    self.peer,
                    state
                );
                Err(self.fail(SessionError::UnexpectedMessage { state, id }))
            }
        }
    }
}

impl<C: Connection> Drop for PeerSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeError;
    use crate::handshake::Handshake;
    use std::io::Cursor;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const INFO_HASH: [u8; 20] = [0xab; 20];
    const LOCAL_ID: [u8; 20] = [1; 20];
    const REMOTE_ID: [u8; 20] = [2; 20];

    /// In-memory connection replaying a fixed byte script.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Arc<Mutex<Vec<u8>>>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Connection for Scripted {
        fn set_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> io::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        session: PeerSession<Scripted>,
        output: Arc<Mutex<Vec<u8>>>,
        shutdowns: Arc<AtomicUsize>,
    }

    fn harness(input: Vec<u8>) -> Harness {
        let output = Arc::new(Mutex::new(Vec::new()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = Scripted {
            input: Cursor::new(input),
            output: output.clone(),
            shutdowns: shutdowns.clone(),
        };
        Harness {
            session: PeerSession::new(PeerAddress::new(Ipv4Addr::LOCALHOST, 6881), conn),
            output,
            shutdowns,
        }
    }

    fn reply() -> Vec<u8> {
        Handshake::new(INFO_HASH, REMOTE_ID).serialize().to_vec()
    }

    /// Wire bytes of a well-formed message of kind `id`; `None` is a keep-alive.
    fn frame(id: Option<MessageId>) -> Vec<u8> {
        let Some(id) = id else {
            return keep_alive().to_vec();
        };
        let payload = match id {
            MESSAGE_HAVE => vec![0, 0, 0, 1],
            MESSAGE_BITFIELD => vec![0xff],
            MESSAGE_REQUEST | MESSAGE_CANCEL => vec![0; 12],
            MESSAGE_PIECE => vec![0, 0, 0, 0, 0, 0, 0, 0, 42],
            _ => vec![],
        };
        Message::new_with_payload(id, payload).serialize()
    }

    fn script(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    /// Every kind of frame a peer could send, plus an unknown id.
    fn all_frames() -> Vec<Option<MessageId>> {
        let mut frames: Vec<Option<MessageId>> = (0..=8).map(Some).collect();
        frames.push(Some(20));
        frames.push(None);
        frames
    }

    #[test]
    fn establish_walks_every_state() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
        ]));
        assert_eq!(h.session.state(), SessionState::Connected);

        assert_eq!(h.session.handshake(&INFO_HASH, &LOCAL_ID).unwrap(), REMOTE_ID);
        assert_eq!(h.session.state(), SessionState::HandshakeVerified);

        assert!(h.session.await_bitfield().unwrap().has_piece(7));
        assert_eq!(h.session.state(), SessionState::BitfieldReceived);

        h.session.send_interested().unwrap();
        assert_eq!(h.session.state(), SessionState::InterestedSent);

        h.session.await_unchoke().unwrap();
        assert_eq!(h.session.state(), SessionState::Unchoked);
        assert!(!h.session.is_choked());

        let request = BlockRequest {
            piece_index: 0,
            offset: 0,
            length: 1,
        };
        h.session.send_request(&request).unwrap();
        assert_eq!(h.session.state(), SessionState::Transferring);

        let expected = script(&[
            Handshake::new(INFO_HASH, LOCAL_ID).serialize().to_vec(),
            Message::new(MESSAGE_INTERESTED).serialize(),
            request.to_message().serialize(),
        ]);
        assert_eq!(*h.output.lock().unwrap(), expected);
    }

    #[test]
    fn info_hash_mismatch_closes_before_transfer() {
        let wrong = Handshake::new([0xcd; 20], REMOTE_ID).serialize().to_vec();
        let mut h = harness(wrong);

        let err = h.session.handshake(&INFO_HASH, &LOCAL_ID).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::InfoHashMismatch { .. })
        ));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.session.await_bitfield(),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn only_bitfield_is_accepted_while_awaiting_bitfield() {
        for kind in all_frames() {
            let mut h = harness(script(&[reply(), frame(kind)]));
            h.session.handshake(&INFO_HASH, &LOCAL_ID).unwrap();
            let result = h.session.await_bitfield().map(|_| ());

            if kind == Some(MESSAGE_BITFIELD) {
                assert!(result.is_ok());
                assert_eq!(h.session.state(), SessionState::BitfieldReceived);
            } else {
                assert!(
                    matches!(
                        result,
                        Err(SessionError::UnexpectedMessage {
                            state: SessionState::AwaitingBitfield,
                            ..
                        })
                    ),
                    "{:?} accepted while awaiting bitfield",
                    kind
                );
                assert_eq!(h.session.state(), SessionState::Closed);
            }
        }
    }

    #[test]
    fn only_unchoke_is_accepted_after_interested() {
        for kind in all_frames() {
            let mut h = harness(script(&[
                reply(),
                frame(Some(MESSAGE_BITFIELD)),
                frame(kind),
            ]));
            h.session.handshake(&INFO_HASH, &LOCAL_ID).unwrap();
            h.session.await_bitfield().unwrap();
            h.session.send_interested().unwrap();
            let result = h.session.await_unchoke();

            if kind == Some(MESSAGE_UNCHOKE) {
                assert!(result.is_ok());
            } else {
                assert!(
                    matches!(
                        result,
                        Err(SessionError::UnexpectedMessage {
                            state: SessionState::InterestedSent,
                            ..
                        })
                    ),
                    "{:?} accepted while waiting for unchoke",
                    kind
                );
                assert_eq!(h.session.state(), SessionState::Closed);
            }
        }
    }

    #[test]
    fn transferring_accepts_only_the_table() {
        let accepted = [
            Some(MESSAGE_CHOKE),
            Some(MESSAGE_UNCHOKE),
            Some(MESSAGE_HAVE),
            Some(MESSAGE_PIECE),
            None,
        ];
        for kind in all_frames() {
            // A trailing choke gives accepted HAVEs and keep-alives something to return.
            let mut h = harness(script(&[
                reply(),
                frame(Some(MESSAGE_BITFIELD)),
                frame(Some(MESSAGE_UNCHOKE)),
                frame(kind),
                frame(Some(MESSAGE_CHOKE)),
            ]));
            h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();
            h.session
                .send_request(&BlockRequest {
                    piece_index: 0,
                    offset: 0,
                    length: 1,
                })
                .unwrap();
            let result = h.session.receive_next();

            if accepted.contains(&kind) {
                assert!(result.is_ok(), "{:?} rejected while transferring", kind);
                assert_eq!(h.session.state(), SessionState::Transferring);
            } else {
                assert!(
                    matches!(result, Err(SessionError::UnexpectedMessage { .. })),
                    "{:?} accepted while transferring",
                    kind
                );
                assert_eq!(h.session.state(), SessionState::Closed);
            }
        }
    }

    #[test]
    fn transition_table_is_exhaustive() {
        let allowed = [
            (SessionState::AwaitingBitfield, MESSAGE_BITFIELD),
            (SessionState::InterestedSent, MESSAGE_UNCHOKE),
            (SessionState::Transferring, MESSAGE_PIECE),
            (SessionState::Unchoked, MESSAGE_CHOKE),
            (SessionState::Unchoked, MESSAGE_UNCHOKE),
            (SessionState::Unchoked, MESSAGE_HAVE),
            (SessionState::Transferring, MESSAGE_CHOKE),
            (SessionState::Transferring, MESSAGE_UNCHOKE),
            (SessionState::Transferring, MESSAGE_HAVE),
        ];
        for state in SessionState::ALL {
            for id in 0..=u8::MAX {
                let listed = allowed.contains(&(state, id));
                assert_eq!(
                    state.on_message(id).is_some(),
                    listed,
                    "{:?} x {}",
                    state,
                    id
                );
            }
        }
    }

    #[test]
    fn have_updates_bitfield_and_choke_blocks_requests() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
            Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 0, 12]).serialize(),
            frame(Some(MESSAGE_CHOKE)),
            frame(Some(MESSAGE_UNCHOKE)),
        ]));
        h.session.piece_count = Some(16);
        h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();
        let request = BlockRequest {
            piece_index: 0,
            offset: 0,
            length: 1,
        };
        h.session.send_request(&request).unwrap();

        assert_eq!(h.session.receive_next().unwrap(), Incoming::Choke);
        assert!(h.session.bitfield().has_piece(12));
        assert!(h.session.is_choked());
        assert!(matches!(
            h.session.send_request(&request),
            Err(SessionError::InvalidState { .. })
        ));

        assert_eq!(h.session.receive_next().unwrap(), Incoming::Unchoke);
        h.session.send_request(&request).unwrap();
    }

    fn have(index: u32) -> Vec<u8> {
        Message::new_with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec()).serialize()
    }

    #[test]
    fn have_beyond_piece_count_closes_session() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
            have(u32::MAX),
        ]));
        h.session.piece_count = Some(4);
        h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();

        assert!(matches!(
            h.session.receive_next(),
            Err(SessionError::Framing(FramingError::Malformed {
                id: MESSAGE_HAVE,
                ..
            }))
        ));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.session.bitfield().as_bytes().len(), 1);
    }

    #[test]
    fn have_is_bounded_by_bitfield_without_piece_count() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
            have(7),
            have(8),
        ]));
        h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();

        assert!(matches!(
            h.session.receive_next(),
            Err(SessionError::Framing(FramingError::Malformed { .. }))
        ));
        assert_eq!(h.session.bitfield().as_bytes(), &[0xff]);
    }

    #[test]
    fn oversized_bitfield_is_cut_to_piece_count() {
        let bitfield = Message::new_with_payload(MESSAGE_BITFIELD, vec![0xff; 1024]).serialize();
        let mut h = harness(script(&[reply(), bitfield]));
        h.session.piece_count = Some(10);
        h.session.handshake(&INFO_HASH, &LOCAL_ID).unwrap();

        assert_eq!(h.session.await_bitfield().unwrap().as_bytes().len(), 2);
    }

    #[test]
    fn keep_alives_do_not_extend_the_deadline() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
            frame(None),
            frame(None),
            frame(Some(MESSAGE_CHOKE)),
        ]));
        h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();

        let err = h.session.receive_before(Some(Instant::now())).unwrap_err();
        assert!(matches!(err, SessionError::Framing(FramingError::Timeout)));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[test]
    fn operations_out_of_order_are_refused() {
        let mut h = harness(reply());
        assert!(matches!(
            h.session.send_interested(),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            h.session.receive_next(),
            Err(SessionError::InvalidState { .. })
        ));
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[test]
    fn peer_closing_mid_transfer_is_a_framing_error() {
        let mut h = harness(script(&[
            reply(),
            frame(Some(MESSAGE_BITFIELD)),
            frame(Some(MESSAGE_UNCHOKE)),
        ]));
        h.session.establish(&INFO_HASH, &LOCAL_ID).unwrap();
        assert!(matches!(
            h.session.receive_next(),
            Err(SessionError::Framing(_))
        ));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[test]
    fn cancelled_session_stops_reading() {
        let cancel = CancelToken::new();
        let h = harness(script(&[reply(), frame(Some(MESSAGE_BITFIELD))]));
        let mut session = h.session.with_cancel(cancel.clone());
        session.handshake(&INFO_HASH, &LOCAL_ID).unwrap();
        cancel.cancel();
        assert!(matches!(
            session.await_bitfield(),
            Err(SessionError::Cancelled)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = harness(vec![]);
        h.session.close();
        h.session.close();
        drop(h.session);
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }
}
