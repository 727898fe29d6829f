use crate::config::Config;
use crate::storage::Storage;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything one download run needs, fixed before any peer is contacted.
pub struct Downloader {
    /// The parsed torrent metadata.
    pub torrent: Arc<tds_core::Torrent>,
    /// The unique Peer ID generated for this client session.
    pub peer_id: [u8; 20],
    /// The storage manager handle.
    pub storage: Storage,
    /// File the pieces are written into, pre-sized to the torrent length.
    pub output_path: PathBuf,
    /// Progress cache kept next to the output file.
    pub cache_path: PathBuf,
    pub config: Arc<Config>,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Pieces fetched from peers during this run.
    pub downloaded: usize,
    /// Pieces already complete according to the cache when the run started.
    pub resumed: usize,
    pub total: usize,
}

impl DownloadSummary {
    pub fn is_complete(&self) -> bool {
        self.downloaded + self.resumed >= self.total
    }
}
