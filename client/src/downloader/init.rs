use super::state::Downloader;
use crate::cache::ProgressCache;
use crate::config::Config;
use crate::error::DownloadError;
use crate::peer::generate_peer_id;
use crate::piece::sha1;
use crate::storage::Storage;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tds_core::Torrent;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

/// Initializes a `Downloader` instance from a parsed `Torrent`.
///
/// This function:
/// 1. Initializes the `Storage` for the download directory.
/// 2. Generates a random Peer ID.
/// 3. Opens (or creates) the output file and sizes it to the torrent length.
///
/// Existing file contents are kept so an interrupted download can resume.
pub async fn from_torrent(
    torrent: Torrent,
    output_dir: Option<PathBuf>,
    config: Config,
) -> Result<Downloader, DownloadError> {
    let storage = Storage::new(output_dir)
        .await
        .map_err(DownloadError::Storage)?;
    info!(dir = %storage.dir().display(), "download directory");
    info!(
        info_hash = %hex::encode(torrent.info_hash),
        pieces = torrent.piece_count(),
        length = torrent.length,
        "torrent loaded"
    );

    let output_path = storage.get_file_path(&torrent.name);
    let cache_path = storage.cache_path(&torrent.name);
    open_output(&output_path, torrent.length)
        .await
        .map_err(DownloadError::OutputFile)?;

    Ok(Downloader {
        torrent: Arc::new(torrent),
        peer_id: generate_peer_id(),
        storage,
        output_path,
        cache_path,
        config: Arc::new(config),
    })
}

/// Opens the output file for reading and writing, creating it if needed and
/// growing or shrinking it to `length`.
pub(crate) async fn open_output(path: &Path, length: u64) -> io::Result<File> {
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;

    if file.metadata().await?.len() != length {
        file.set_len(length).await?;
    }
    Ok(file)
}

/// Rebuilds the progress cache from the data already on disk.
///
/// Every piece is read back from the output file and hashed; matching pieces
/// are marked complete and the others are left for the next run. The fresh
/// cache replaces whatever was saved before.
pub async fn recheck(downloader: &Downloader) -> Result<ProgressCache, DownloadError> {
    info!("checking existing data");
    let torrent = &downloader.torrent;
    let mut file = open_output(&downloader.output_path, torrent.length)
        .await
        .map_err(DownloadError::OutputFile)?;

    let mut cache = ProgressCache::default();
    for (i, expected) in torrent.pieces.iter().enumerate() {
        let index = i as u32;
        let mut buf = vec![0u8; torrent.piece_len(index) as usize];
        if let Err(e) = read_piece(&mut file, torrent.piece_offset(index), &mut buf).await {
            warn!(piece = index, error = %e, "could not read piece back");
            continue;
        }
        if sha1(&buf) == *expected {
            cache.mark_complete(index);
        }
    }

    if let Err(e) = cache.save(&downloader.cache_path).await {
        warn!(error = %e, "failed to save progress cache");
    }
    info!(
        have = cache.completed_count(),
        total = torrent.piece_count(),
        "existing data checked"
    );
    Ok(cache)
}

async fn read_piece(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}
