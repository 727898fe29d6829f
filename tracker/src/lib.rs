//! Tracker announce clients.
//!
//! The download side only needs one thing from a tracker: a list of peer
//! addresses for the torrent. [`get_peers`] asks every tracker the torrent
//! names and merges what comes back.

use std::net::SocketAddrV4;
use tds_core::Torrent;
use tds_core::bencoding::BencodeError;
use thiserror::Error;
use tracing::{info, warn};

pub mod http;
pub mod udp;

use http::HttpTracker;
use udp::UdpTracker;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] BencodeError),

    #[error("tracker socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tracker url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),

    #[error("tracker protocol error: {0}")]
    Protocol(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no tracker returned any peers")]
    NoPeers,
}

#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
    pub numwant: Option<u32>,
}

impl TrackerRequest {
    /// A `started` announce for a fresh download of `torrent`.
    pub fn started(torrent: &Torrent, peer_id: [u8; 20], port: u16) -> Self {
        Self {
            info_hash: torrent.info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: torrent.length,
            event: Some(TrackerEvent::Started),
            numwant: Some(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct TrackerResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddrV4>,
    pub complete: Option<u32>,   // seeders
    pub incomplete: Option<u32>, // leechers
}

pub trait TrackerClient {
    fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError>;
}

pub fn get_tracker_client(url: &str) -> Option<Box<dyn TrackerClient + Send>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(Box::new(HttpTracker::new(url)))
    } else if url.starts_with("udp://") {
        Some(Box::new(UdpTracker::new(url)))
    } else {
        None
    }
}

/// Announces to each tracker in turn and returns the de-duplicated peers.
///
/// Individual tracker failures are logged; the call only fails when no
/// tracker produced a single peer.
pub async fn get_peers(
    torrent: &Torrent,
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddrV4>, TrackerError> {
    let request = TrackerRequest::started(torrent, peer_id, port);
    let mut peers: Vec<SocketAddrV4> = Vec::new();

    for url in torrent.tracker_urls() {
        info!(%url, "contacting tracker");
        let req = request.clone();
        let target = url.clone();
        let result = tokio::task::spawn_blocking(move || match get_tracker_client(&target) {
            Some(client) => client.announce(&req),
            None => Err(TrackerError::UnsupportedScheme(target)),
        })
        .await
        .map_err(|e| TrackerError::Protocol(format!("announce task failed: {e}")))?;

        match result {
            Ok(response) => {
                info!(%url, peers = response.peers.len(), "tracker responded");
                for peer in response.peers {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
            Err(e) => warn!(%url, error = %e, "tracker announce failed"),
        }
    }

    if peers.is_empty() {
        return Err(TrackerError::NoPeers);
    }
    Ok(peers)
}

/// Splits a compact peer list (6 bytes per IPv4 peer) into addresses.
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}
