//! Download side: one worker per peer pulling whole pieces off a shared
//! queue, and a single aggregator storing verified pieces.

mod init;
mod manager;
mod queue;
mod state;
mod worker;

pub use queue::{NextWork, WorkQueue};
pub use state::{DownloadSummary, Downloader};
pub use worker::download_piece;

use crate::cache::ProgressCache;
use crate::config::Config;
use crate::error::DownloadError;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

impl Downloader {
    pub async fn new(
        torrent_path: impl AsRef<Path>,
        output_dir: Option<PathBuf>,
        config: Config,
    ) -> Result<Self, DownloadError> {
        let torrent = tds_core::parse_torrent(torrent_path)?;
        init::from_torrent(torrent, output_dir, config).await
    }

    pub async fn from_torrent(
        torrent: tds_core::Torrent,
        output_dir: Option<PathBuf>,
        config: Config,
    ) -> Result<Self, DownloadError> {
        init::from_torrent(torrent, output_dir, config).await
    }

    /// Hashes the data already on disk and rewrites the progress cache.
    pub async fn recheck(&self) -> Result<ProgressCache, DownloadError> {
        init::recheck(self).await
    }

    /// Asks the torrent's trackers for peers.
    pub async fn discover_peers(&self) -> Result<Vec<SocketAddr>, DownloadError> {
        let peers =
            tracker::get_peers(&self.torrent, self.peer_id, self.config.listen_port).await?;
        Ok(peers.into_iter().map(SocketAddr::V4).collect())
    }

    pub async fn run(&self, peers: Vec<SocketAddr>) -> Result<DownloadSummary, DownloadError> {
        manager::run(self, peers).await
    }
}
