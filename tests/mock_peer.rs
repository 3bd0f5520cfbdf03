//! Mock BitTorrent Peer for Testing
//!
//! A blocking TCP peer serving a fixed file, used to test downloads without
//! real peers. It speaks just enough of the wire protocol to seed: handshake,
//! bitfield, unchoke on interest, and PIECE replies to REQUESTs.

#![allow(dead_code)]

use leech::verify::sha1_digest;
use leech::{PeerAddress, TorrentDescriptor};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Protocol string for BitTorrent handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// How the mock peer misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Serves correct data
    Honest,
    /// Answers the first request of each connection with a block for the
    /// wrong piece before the right one
    WrongIndexOnce,
    /// Serves data that fails hash verification
    Corrupt,
    /// Replies to the handshake with another info hash
    WrongInfoHash,
    /// Unchokes, then never answers a request
    Silent,
}

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// The whole file
    pub data: Arc<Vec<u8>>,
    pub piece_length: u32,
    /// Pieces advertised in the bitfield, `None` for all of them
    pub pieces: Option<Vec<u32>>,
    pub behaviour: Behaviour,
}

impl MockPeerConfig {
    pub fn new(descriptor: &TorrentDescriptor, data: &[u8]) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MO0001-");

        Self {
            info_hash: descriptor.info_hash,
            peer_id,
            data: Arc::new(data.to_vec()),
            piece_length: descriptor.piece_length,
            pieces: None,
            behaviour: Behaviour::Honest,
        }
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Only advertise these pieces
    pub fn with_pieces(mut self, pieces: Vec<u32>) -> Self {
        self.pieces = Some(pieces);
        self
    }

    fn piece_count(&self) -> u32 {
        (self.data.len() as u32).div_ceil(self.piece_length)
    }

    fn bitfield(&self) -> Vec<u8> {
        let count = self.piece_count();
        let mut bitfield = vec![0u8; count.div_ceil(8) as usize];
        for index in 0..count {
            let advertised = match &self.pieces {
                Some(pieces) => pieces.contains(&index),
                None => true,
            };
            if advertised {
                bitfield[(index / 8) as usize] |= 0x80 >> (index % 8);
            }
        }
        bitfield
    }
}

/// A mock BitTorrent peer listening on localhost
pub struct MockPeer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl MockPeer {
    /// Start serving on an ephemeral port. The listener thread lives until
    /// the test process exits.
    pub fn spawn(config: MockPeerConfig) -> MockPeer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock peer");
        let addr = listener.local_addr().expect("mock peer address");
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        let counters = (connections.clone(), requests.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                counters.0.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let requests = counters.1.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &config, &requests);
                });
            }
        });

        MockPeer {
            addr,
            connections,
            requests,
        }
    }

    pub fn address(&self) -> PeerAddress {
        match self.addr {
            SocketAddr::V4(addr) => PeerAddress::from(addr),
            SocketAddr::V6(_) => unreachable!("mock peer binds IPv4"),
        }
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of REQUEST messages received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Build a descriptor (and its file) of `total_length` bytes.
pub fn torrent(total_length: usize, piece_length: u32) -> (TorrentDescriptor, Vec<u8>) {
    let data: Vec<u8> = (0..total_length).map(|i| (i * 7 + i / 251) as u8).collect();
    let hashes = data
        .chunks(piece_length as usize)
        .map(sha1_digest)
        .collect();
    let descriptor = TorrentDescriptor::new(
        "mock.bin".to_string(),
        vec![],
        total_length as u64,
        piece_length,
        hashes,
        sha1_digest(b"mock info dictionary"),
    )
    .expect("valid mock torrent");
    (descriptor, data)
}

fn write_message(stream: &mut TcpStream, id: u8, payload: &[u8]) -> io::Result<()> {
    let mut frame = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
    frame.push(id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

/// Read one message; `None` id for a keep-alive.
fn read_message(stream: &mut TcpStream) -> io::Result<(Option<u8>, Vec<u8>)> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 {
        return Ok((None, vec![]));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let payload = buf.split_off(1);
    Ok((Some(buf[0]), payload))
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn serve(mut stream: TcpStream, config: &MockPeerConfig, requests: &AtomicUsize) -> io::Result<()> {
    // Handshake
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake)?;
    if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
        return Ok(());
    }

    let mut info_hash = config.info_hash;
    if config.behaviour == Behaviour::WrongInfoHash {
        info_hash[0] ^= 0xff;
    }
    let mut reply = vec![19u8];
    reply.extend_from_slice(PROTOCOL_STRING);
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(&config.peer_id);
    stream.write_all(&reply)?;

    write_message(&mut stream, 5, &config.bitfield())?;

    let mut sent_wrong_index = false;
    loop {
        let (id, payload) = read_message(&mut stream)?;
        match id {
            // Interested
            Some(2) => write_message(&mut stream, 1, &[])?,
            // Request
            Some(6) if payload.len() == 12 => {
                requests.fetch_add(1, Ordering::SeqCst);
                if config.behaviour == Behaviour::Silent {
                    continue;
                }

                let index = read_u32(&payload[0..4]);
                let offset = read_u32(&payload[4..8]);
                let length = read_u32(&payload[8..12]);
                let start = (index * config.piece_length + offset) as usize;
                let mut block = config.data[start..start + length as usize].to_vec();

                if config.behaviour == Behaviour::WrongIndexOnce && !sent_wrong_index {
                    sent_wrong_index = true;
                    let mut wrong = (index + 1).to_be_bytes().to_vec();
                    wrong.extend_from_slice(&offset.to_be_bytes());
                    wrong.extend(block.iter().map(|b| b ^ 0xff));
                    write_message(&mut stream, 7, &wrong)?;
                }
                if config.behaviour == Behaviour::Corrupt {
                    block[0] ^= 0xff;
                }

                let mut piece = index.to_be_bytes().to_vec();
                piece.extend_from_slice(&offset.to_be_bytes());
                piece.extend_from_slice(&block);
                write_message(&mut stream, 7, &piece)?;
            }
            _ => {}
        }
    }
}
