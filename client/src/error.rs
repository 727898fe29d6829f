//! Error types.
//!
//! Everything in [`PeerError`] is scoped to one connection: the worker or
//! seeding task that owns the connection handles it and never lets it reach
//! the scheduler. [`DownloadError`] is the short list of conditions that end
//! the whole run.

use std::path::PathBuf;
use tds_core::MetainfoError;
use thiserror::Error;
use tracker::TrackerError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake")]
    Malformed,

    #[error("info hash mismatch: expected {expected}, received {received}")]
    InfoHashMismatch { expected: String, received: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("stream closed in the middle of a frame")]
    Truncated,

    #[error("{kind} payload of {len} bytes is too short")]
    ShortPayload { kind: &'static str, len: usize },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    Oversized(u32),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("piece {index} failed hash verification")]
    Verification { index: u32 },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no progress cache at {0}")]
    NotFound(PathBuf),

    #[error("progress cache is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("progress cache io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to read torrent metadata: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("tracker lookup failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("failed to prepare output file: {0}")]
    OutputFile(std::io::Error),

    #[error("failed to prepare download directory: {0}")]
    Storage(std::io::Error),

    #[error("every peer is gone with {missing} pieces still missing")]
    SwarmExhausted { missing: usize },
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to load availability: {0}")]
    Cache(#[from] CacheError),

    #[error("cannot open source file {path}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("source file is {actual} bytes but the torrent describes {expected}")]
    SourceLength { expected: u64, actual: u64 },

    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
}
