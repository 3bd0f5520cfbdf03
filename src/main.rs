//! # Leech BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Usage
//!
//! ```bash
//! leech decode <bencoded_value>
//! leech info <torrent_file>
//! leech peers <torrent_file>
//! leech handshake <torrent_file> <ip:port>
//! leech download_piece -o <output_file> <torrent_file> <piece_index>
//! leech download [-o <output_file>] <torrent_file>
//! ```
//!
//! Logging is controlled with `RUST_LOG` (e.g. `RUST_LOG=leech=debug`).

#[macro_use]
extern crate log;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use leech::session::PeerSession;
use leech::{
    bencode, tracker, DownloadConfig, Downloader, FileStorage, MemoryStorage, PeerAddress,
    Storage, TorrentDescriptor,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// Bencoded value, e.g. "d3:foo3:bare"
        value: String,
    },
    /// Print the metadata of a .torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Announce to the trackers and print the peers they return
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,

        #[command(flatten)]
        options: Options,
    },
    /// Handshake with a single peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,

        /// Peer address as ip:port
        peer: PeerAddress,

        #[command(flatten)]
        options: Options,
    },
    /// Download and verify a single piece
    #[command(name = "download_piece", alias = "download-piece")]
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Path to the .torrent file
        torrent: PathBuf,

        /// Zero-based piece index
        index: u32,

        #[command(flatten)]
        options: Options,
    },
    /// Download the whole file
    Download {
        /// Output filename (defaults to name from torrent)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Path to the .torrent file
        torrent: PathBuf,

        #[command(flatten)]
        options: Options,
    },
}

#[derive(Args, Debug)]
struct Options {
    /// Port announced to the tracker
    #[arg(long, default_value_t = leech::config::DEFAULT_PORT)]
    port: u16,

    /// Maximum number of peers downloaded from at once
    #[arg(long, default_value_t = 5)]
    max_peers: usize,

    /// Retries allowed per piece before giving up
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Block requests pipelined per peer
    #[arg(long, default_value_t = 5)]
    window: usize,
}

impl Options {
    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            port: self.port,
            max_sessions: self.max_peers,
            retry_budget: self.retries,
            timeout: Duration::from_secs(self.timeout),
            window: self.window,
            ..DownloadConfig::default()
        }
    }
}

/// Storage wrapper advancing a progress bar.
struct Progress<S> {
    inner: S,
    bar: ProgressBar,
}

impl<S: Storage> Storage for Progress<S> {
    fn write_piece(&self, index: u32, data: &[u8]) -> io::Result<()> {
        self.inner.write_piece(index, data)?;
        self.bar.inc(data.len() as u64);
        Ok(())
    }
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Ask before clobbering an existing file.
fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", path.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn open_torrent(path: &Path) -> Result<TorrentDescriptor> {
    TorrentDescriptor::open(path)
        .with_context(|| format!("could not open torrent '{}'", path.display()))
}

fn find_peers(descriptor: &TorrentDescriptor, config: &DownloadConfig) -> Result<Vec<PeerAddress>> {
    println!("Retrieve peers...");
    let announce = tracker::announce(descriptor, &config.peer_id, config.port)?;
    Ok(announce.peers)
}

fn print_info(descriptor: &TorrentDescriptor) {
    for url in descriptor.tracker_urls() {
        println!("Tracker URL: {}", url);
    }
    println!("Length: {}", descriptor.total_length);
    println!("Info Hash: {}", hex::encode(descriptor.info_hash));
    println!("Piece Length: {}", descriptor.piece_length);
    println!("Piece Hashes:");
    for hash in &descriptor.piece_hashes {
        println!("{}", hex::encode(hash));
    }
}

fn download_piece(output: &Path, torrent: &Path, index: u32, options: &Options) -> Result<()> {
    let descriptor = open_torrent(torrent)?;
    let config = options.config();
    let peers = find_peers(&descriptor, &config)?;

    let storage = MemoryStorage::new();
    Downloader::new(&descriptor, peers, config)
        .pieces([index])
        .run(&storage)?;

    let data = storage
        .piece(index)
        .ok_or_else(|| anyhow!("piece {} was not downloaded", index))?;
    fs::write(output, data)
        .with_context(|| format!("could not write piece to '{}'", output.display()))?;

    println!("Piece {} downloaded to {}.", index, output.display());

    Ok(())
}

fn download(output: Option<&Path>, torrent: &Path, options: &Options) -> Result<()> {
    let descriptor = open_torrent(torrent)?;

    // Determine output filename
    let output = match output {
        Some(output) => output.to_path_buf(),
        None => PathBuf::from(sanitize_filename(&descriptor.name)),
    };

    // Check if output file already exists
    if output.exists() && !confirm_overwrite(&output)? {
        println!("Download cancelled.");
        return Ok(());
    }

    let config = options.config();
    let peers = find_peers(&descriptor, &config)?;

    println!(
        "Downloading {:?} ({} pieces)",
        descriptor.name,
        descriptor.piece_count()
    );

    let storage = FileStorage::create(&output, &descriptor)
        .with_context(|| format!("could not create output file '{}'", output.display()))?;

    // Create progress bar
    let bar = ProgressBar::new(descriptor.total_length);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );
    let progress = Progress {
        inner: storage,
        bar,
    };

    let result = leech::download(&descriptor, &peers, &config, &progress);
    progress.bar.finish_and_clear();

    match result {
        Ok(report) => {
            let path = progress.inner.finalize()?;
            info!("Downloaded {} bytes", report.bytes_downloaded);
            println!("Saved in \"{}\".", path.display());
            Ok(())
        }
        Err(e) => {
            if let Err(discard) = progress.inner.discard() {
                warn!("Could not remove partial file: {}", discard);
            }
            Err(e.into())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Decode { value } => {
            let decoded = bencode::decode(value.as_bytes())?;
            println!("{}", bencode::to_json(&decoded));
        }
        Command::Info { torrent } => {
            print_info(&open_torrent(&torrent)?);
        }
        Command::Peers { torrent, options } => {
            let descriptor = open_torrent(&torrent)?;
            for peer in find_peers(&descriptor, &options.config())? {
                println!("{}", peer);
            }
        }
        Command::Handshake {
            torrent,
            peer,
            options,
        } => {
            let descriptor = open_torrent(&torrent)?;
            let config = options.config();
            let mut session = PeerSession::connect(peer, config.timeout)?;
            let peer_id = session.handshake(&descriptor.info_hash, &config.peer_id)?;
            println!("Peer ID: {}", hex::encode(peer_id));
        }
        Command::DownloadPiece {
            output,
            torrent,
            index,
            options,
        } => download_piece(&output, &torrent, index, &options)?,
        Command::Download {
            output,
            torrent,
            options,
        } => download(output.as_deref(), &torrent, &options)?,
    }

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let cli = Cli::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(cli) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
