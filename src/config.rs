//! Download configuration.

use rand::Rng;
use std::time::Duration;

/// Default port announced to trackers. Nothing listens on it: the client
/// only makes outbound connections.
pub const DEFAULT_PORT: u16 = 6881;

/// Client prefix of generated peer ids (Azureus style).
const PEER_ID_PREFIX: &[u8; 8] = b"-LE0001-";

/// Knobs of a download.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// 20-byte identifier sent in handshakes and announces
    pub peer_id: [u8; 20],
    /// Port announced to the tracker
    pub port: u16,
    /// Maximum number of peer sessions running at once
    pub max_sessions: usize,
    /// How many times a failed piece is retried before the download fails
    pub retry_budget: u32,
    /// Bound on every blocking network operation (connect, handshake, read, write)
    pub timeout: Duration,
    /// Maximum number of pipelined block requests per session
    pub window: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            peer_id: generate_peer_id(),
            port: DEFAULT_PORT,
            max_sessions: 5,
            retry_budget: 3,
            timeout: Duration::from_secs(15),
            window: 5,
        }
    }
}

/// Generate a random peer id carrying this client's prefix.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}
