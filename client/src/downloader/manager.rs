use super::init::open_output;
use super::queue::WorkQueue;
use super::state::{DownloadSummary, Downloader};
use super::worker::{WorkerContext, run_worker};
use crate::cache::ProgressCache;
use crate::error::DownloadError;
use crate::piece::{PieceRequest, PieceResult, piece_requests};
use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Downloads every piece the progress cache does not already hold.
///
/// One worker per peer feeds verified pieces into a single-slot channel;
/// this task is the only writer of the output file and the cache. The run
/// ends when every piece is stored, or with [`DownloadError::SwarmExhausted`]
/// once all workers are gone and pieces are still missing.
pub async fn run(
    downloader: &Downloader,
    peers: Vec<SocketAddr>,
) -> Result<DownloadSummary, DownloadError> {
    let torrent = &downloader.torrent;
    let total = torrent.piece_count();
    let mut cache = ProgressCache::load_or_default(&downloader.cache_path).await;
    let resumed = (0..total as u32).filter(|&i| cache.is_complete(i)).count();

    if cache.is_finished(total) {
        info!(pieces = total, "all pieces already downloaded");
        return Ok(DownloadSummary {
            downloaded: 0,
            resumed,
            total,
        });
    }

    let queue = Arc::new(WorkQueue::new(piece_requests(torrent, &cache)));
    let (tx, mut rx) = mpsc::channel::<PieceResult>(1);
    let active = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    let mut seen = HashSet::new();
    for addr in peers
        .into_iter()
        .filter(|addr| seen.insert(*addr))
        .take(downloader.config.max_peers)
    {
        let ctx = WorkerContext {
            torrent: torrent.clone(),
            peer_id: downloader.peer_id,
            config: downloader.config.clone(),
            queue: queue.clone(),
            results: tx.clone(),
            active: active.clone(),
        };
        workers.spawn(run_worker(addr, ctx));
    }
    drop(tx);
    info!(peers = workers.len(), missing = queue.len(), "download started");

    let mut file = open_output(&downloader.output_path, torrent.length)
        .await
        .map_err(DownloadError::OutputFile)?;

    let mut downloaded = 0;
    let outcome = loop {
        if cache.is_finished(total) {
            break Ok(());
        }
        let Some(result) = rx.recv().await else {
            let missing = (0..total as u32).filter(|&i| !cache.is_complete(i)).count();
            break Err(DownloadError::SwarmExhausted { missing });
        };
        if cache.is_complete(result.index) {
            continue;
        }

        let offset = torrent.piece_offset(result.index);
        if let Err(e) = write_piece(&mut file, offset, &result.data).await {
            error!(piece = result.index, error = %e, "failed to write piece");
            queue.push(PieceRequest {
                index: result.index,
                hash: torrent.pieces[result.index as usize],
                length: result.data.len() as u32,
            });
            continue;
        }

        cache.mark_complete(result.index);
        downloaded += 1;
        if let Err(e) = cache.save(&downloader.cache_path).await {
            warn!(error = %e, "failed to save progress cache");
        }

        let done = resumed + downloaded;
        info!(
            piece = result.index,
            progress = %format!("{:.2}%", done as f64 * 100.0 / total as f64),
            peers = active.load(Ordering::Relaxed),
            "downloaded piece {done}/{total}"
        );
    };

    queue.close();
    workers.shutdown().await;
    outcome?;

    info!(pieces = total, path = %downloader.output_path.display(), "download complete");
    Ok(DownloadSummary {
        downloaded,
        resumed,
        total,
    })
}

async fn write_piece(file: &mut File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}
