//! # Leech
//!
//! A BitTorrent download engine: peer wire protocol, piece scheduling and
//! verification, plus the metainfo, tracker and storage glue around them.
//!
//! ## Architecture
//!
//! - **Orchestrator** ([`download`]): owns the set of incomplete pieces and
//!   hands them out one at a time
//! - **Workers**: one thread per peer session, each downloading, verifying
//!   and storing the pieces it is given
//! - **Channels**: crossbeam channels carry assignments to workers and
//!   results back
//!
//! ## Example
//!
//! ```no_run
//! use leech::{tracker, DownloadConfig, MemoryStorage, TorrentDescriptor};
//!
//! # fn main() -> anyhow::Result<()> {
//! let descriptor = TorrentDescriptor::open("debian.iso.torrent")?;
//! let config = DownloadConfig::default();
//! let announce = tracker::announce(&descriptor, &config.peer_id, config.port)?;
//!
//! let storage = MemoryStorage::new();
//! let report = leech::download(&descriptor, &announce.peers, &config, &storage)?;
//! println!("{} bytes", report.bytes_downloaded);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod bencode;
pub mod bitfield;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod handshake;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod verify;
pub mod worker;

pub use cancel::CancelToken;
pub use config::DownloadConfig;
pub use download::{download, DownloadReport, Downloader};
pub use error::{
    AttemptError, DownloadError, FramingError, HandshakeError, MetainfoError, SessionError,
    TrackerError, TransferError,
};
pub use metainfo::TorrentDescriptor;
pub use peer::PeerAddress;
pub use storage::{FileStorage, MemoryStorage, Storage};
