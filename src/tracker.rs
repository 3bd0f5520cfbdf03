//! # HTTP Tracker Announce
//!
//! Peers are discovered by announcing to every tracker listed in the torrent.
//! Each announce is an HTTP GET carrying the info hash, our peer id and the
//! download state; the tracker replies with a bencoded dictionary holding a
//! refresh interval and a compact peer list.
//!
//! All unique tracker URLs are queried in parallel. Peers from every
//! successful response are merged and de-duplicated.

use crate::error::TrackerError;
use crate::metainfo::TorrentDescriptor;
use crate::peer::PeerAddress;

use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use std::collections::HashSet;
use std::thread;
use std::time::Duration;
use url::Url;

// Timeout of a single tracker request
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

// Interval assumed when a tracker does not send one
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// BencodeTracker structure.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Human readable reason of a refused announce
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: Option<u64>,
    // Peers IP addresses, compact format
    #[serde(default)]
    peers: Option<ByteBuf>,
}

/// Result of an announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    /// How long to wait before announcing again
    pub interval: Duration,
    /// De-duplicated peers, in the order trackers returned them
    pub peers: Vec<PeerAddress>,
}

/// Announce to every tracker of `descriptor` and collect their peers.
///
/// # Arguments
///
/// * `descriptor` - The torrent being downloaded.
/// * `peer_id` - 20-byte unique identifier of this client.
/// * `port` - Port number announced to the tracker.
///
/// # Errors
///
/// If no tracker answers with peers, the last tracker error is returned, or
/// [`TrackerError::NoPeers`] if every tracker answered with an empty list.
pub fn announce(
    descriptor: &TorrentDescriptor,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<Announce, TrackerError> {
    let tracker_urls = descriptor.tracker_urls();
    if tracker_urls.is_empty() {
        return Err(TrackerError::NoTracker);
    }

    let mut urls = Vec::with_capacity(tracker_urls.len());
    for tracker_url in tracker_urls {
        urls.push(build_tracker_url(
            tracker_url,
            &descriptor.info_hash,
            peer_id,
            port,
            descriptor.total_length,
        )?);
    }

    // Query all trackers in parallel
    let handles: Vec<_> = urls
        .into_iter()
        .map(|url| thread::spawn(move || request(&url)))
        .collect();

    let mut responses = Vec::new();
    let mut last_error = TrackerError::NoPeers;
    for handle in handles {
        match handle.join() {
            Ok(Ok(response)) => responses.push(response),
            Ok(Err(e)) => {
                warn!("Tracker announce failed: {}", e);
                last_error = e;
            }
            Err(_) => error!("Tracker thread panicked"),
        }
    }

    // Deduplicate peers by (ip, port)
    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    let mut interval: Option<Duration> = None;
    for response in responses {
        interval = Some(interval.map_or(response.interval, |i| i.min(response.interval)));
        for peer in response.peers {
            if seen.insert(peer) {
                peers.push(peer);
            }
        }
    }

    if peers.is_empty() {
        return Err(last_error);
    }

    info!("Got {} peers from trackers", peers.len());

    Ok(Announce {
        interval: interval.unwrap_or(DEFAULT_INTERVAL),
        peers,
    })
}

/// Send one announce and decode the reply.
fn request(url: &str) -> Result<Announce, TrackerError> {
    debug!("Announce to {}", url);

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()?;
    let body = client.get(url).send()?.error_for_status()?.bytes()?;

    parse_response(&body)
}

/// Decode a bencoded tracker response.
pub fn parse_response(body: &[u8]) -> Result<Announce, TrackerError> {
    let response = de::from_bytes::<BencodeTracker>(body)?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let peers = match response.peers {
        Some(peers) => PeerAddress::parse_compact(&peers)?,
        None => vec![],
    };

    Ok(Announce {
        interval: response
            .interval
            .map_or(DEFAULT_INTERVAL, Duration::from_secs),
        peers,
    })
}

/// Build tracker URL.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - 20-byte string used as a unique ID for the client.
/// * `port` - Port number that the client is listening on.
/// * `left` - Bytes left to download.
///
pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String, TrackerError> {
    // Parse tracker URL from torrent
    let base_url = Url::parse(announce)?;

    // Build query string manually to handle binary data properly
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

/// Each byte is encoded as %XX where XX is the hexadecimal representation
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}
