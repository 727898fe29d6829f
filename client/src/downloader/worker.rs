//! One worker per peer: connect, then pull pieces the peer has off the
//! shared queue and download them with pipelined block requests.

use super::queue::{NextWork, WorkQueue};
use crate::config::Config;
use crate::error::PeerError;
use crate::peer::{BlockInfo, Message, PeerSession, with_deadline};
use crate::piece::{PieceBuffer, PieceRequest, PieceResult, blocks};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tds_core::Torrent;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub torrent: Arc<Torrent>,
    pub peer_id: [u8; 20],
    pub config: Arc<Config>,
    pub queue: Arc<WorkQueue>,
    pub results: mpsc::Sender<PieceResult>,
    pub active: Arc<AtomicUsize>,
}

/// Keeps the active-worker count honest however the worker exits.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) async fn run_worker(addr: SocketAddr, ctx: WorkerContext) {
    let _active = ActiveGuard::new(&ctx.active);
    let mut session =
        match PeerSession::connect(addr, &ctx.torrent, ctx.peer_id, &ctx.config).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to connect");
                return;
            }
        };
    info!(peer = %addr, "connected");

    match drive(&mut session, &ctx).await {
        Ok(()) => debug!(peer = %addr, "worker finished"),
        Err(e) => warn!(peer = %addr, error = %e, "dropping peer"),
    }
}

/// Runs the session through setup and then downloads until the queue
/// closes, the peer has nothing left we want, or the connection fails.
///
/// A failure while a piece is in hand puts that piece back on the queue
/// before the error is returned.
pub(crate) async fn drive<S>(
    session: &mut PeerSession<S>,
    ctx: &WorkerContext,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.handshake().await?;
    let available = session.read_bitfield().await?.count();
    debug!(peer = %session.name(), available, "received bitfield");
    session.send_unchoke().await?;
    session.send_interested().await?;

    loop {
        let request = match next_work(session, ctx).await? {
            NextWork::Piece(request) => request,
            NextWork::Idle => {
                info!(peer = %session.name(), "peer has no pieces we still need");
                return Ok(());
            }
            NextWork::Closed => return Ok(()),
        };

        let attempt = with_deadline(
            ctx.config.piece_timeout,
            download_piece(session, &request, &ctx.config),
        )
        .await;

        match attempt {
            Ok(data) => {
                debug!(peer = %session.name(), piece = request.index, "piece verified");
                let result = PieceResult {
                    index: request.index,
                    data,
                };
                if ctx.results.send(result).await.is_err() {
                    return Ok(());
                }
                session.send_have(request.index).await?;
            }
            Err(e) => {
                ctx.queue.push(request);
                return Err(e);
            }
        }
    }
}

/// Waits for a queued piece the peer has.
///
/// The peer's messages are read meanwhile, so a `have` or late `bitfield`
/// widens what it can take. The idle limit counts from the start of the
/// wait and is not extended by traffic from the peer.
async fn next_work<S>(
    session: &mut PeerSession<S>,
    ctx: &WorkerContext,
) -> Result<NextWork, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + ctx.config.idle_limit;
    loop {
        let available = session.bitfield().clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            next = ctx.queue.next_for(|index| available.has(index), remaining) => return Ok(next),
            message = session.next_message() => {
                if let Message::Have(index) = message? {
                    debug!(peer = %session.name(), piece = index, "peer announced piece");
                }
            }
        }
    }
}

/// Downloads and verifies one piece from `session`.
///
/// Keeps up to `max_pipeline` block requests outstanding while unchoked.
/// Blocks may arrive in any order. A `choke` drops the outstanding requests,
/// so every block still missing is requested again after the next `unchoke`.
/// Every response for this piece frees a pipeline slot, duplicates included.
pub async fn download_piece<S>(
    session: &mut PeerSession<S>,
    request: &PieceRequest,
    config: &Config,
) -> Result<Vec<u8>, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = PieceBuffer::new(request.index, request.length, config.block_size);
    let mut pending: VecDeque<BlockInfo> =
        blocks(request.index, request.length, config.block_size).collect();
    let mut in_flight = 0usize;

    while !buffer.is_complete() {
        if !session.is_choked() {
            while in_flight < config.max_pipeline {
                let Some(block) = pending.pop_front() else {
                    break;
                };
                session.request_block(block).await?;
                in_flight += 1;
            }
        }

        match session.await_message().await? {
            Message::Piece { index, begin, data } if index == request.index => {
                buffer.insert(begin, &data)?;
                in_flight = in_flight.saturating_sub(1);
            }
            Message::Choke => {
                in_flight = 0;
                pending = buffer.missing().into();
            }
            _ => {}
        }
    }

    buffer.finish(&request.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Handshake, read_handshake, read_message, write_message};
    use crate::piece::sha1;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const CONTENT: &[u8; 18] = b"abcdefghijQRSTUVWX";

    fn torrent() -> Torrent {
        Torrent::new(
            "t",
            [3; 20],
            10,
            18,
            vec![sha1(&CONTENT[..10]), sha1(&CONTENT[10..])],
        )
        .unwrap()
    }

    fn config() -> Config {
        Config {
            block_size: 4,
            max_pipeline: 2,
            read_timeout: Duration::from_secs(2),
            idle_limit: Duration::from_millis(50),
            ..Config::default()
        }
    }

    fn context(queue: Arc<WorkQueue>) -> (WorkerContext, mpsc::Receiver<PieceResult>) {
        let (tx, rx) = mpsc::channel(4);
        let ctx = WorkerContext {
            torrent: Arc::new(torrent()),
            peer_id: [1; 20],
            config: Arc::new(config()),
            queue,
            results: tx,
            active: Arc::new(AtomicUsize::new(0)),
        };
        (ctx, rx)
    }

    fn session(stream: DuplexStream) -> PeerSession<DuplexStream> {
        PeerSession::new(stream, "fake".into(), &torrent(), [1; 20], Duration::from_secs(2))
    }

    /// Minimal remote peer: handshake, full bitfield, unchoke on interest,
    /// then answers requests in pairs in reverse order of arrival, with
    /// `corrupt` flipping the first byte of every block.
    async fn fake_seeder(mut stream: DuplexStream, corrupt: bool) {
        let _ = read_handshake(&mut stream).await.unwrap();
        stream
            .write_all(&Handshake::new([3; 20], [9; 20]).encode())
            .await
            .unwrap();
        write_message(&mut stream, &Message::Bitfield(Bytes::from_static(&[0b1100_0000])))
            .await
            .unwrap();

        let mut batch = Vec::new();
        while let Ok(message) = read_message(&mut stream).await {
            match message {
                Message::Interested => write_message(&mut stream, &Message::Unchoke)
                    .await
                    .unwrap(),
                Message::Request(block) => {
                    let piece_len = if block.index == 0 { 10 } else { 8 };
                    let last = block.begin + block.length == piece_len;
                    batch.push(block);
                    if batch.len() < 2 && !last {
                        continue;
                    }
                    for block in batch.drain(..).rev() {
                        let start = (block.index * 10 + block.begin) as usize;
                        let mut data = CONTENT[start..start + block.length as usize].to_vec();
                        if corrupt {
                            data[0] ^= 0xFF;
                        }
                        let reply = Message::Piece {
                            index: block.index,
                            begin: block.begin,
                            data: data.into(),
                        };
                        if write_message(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_blocks_reassemble() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(fake_seeder(remote, false));

        let queue = Arc::new(WorkQueue::new([PieceRequest {
            index: 0,
            hash: sha1(&CONTENT[..10]),
            length: 10,
        }]));
        let (ctx, mut rx) = context(queue.clone());
        let mut session = session(local);

        drive(&mut session, &ctx).await.unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.data, &CONTENT[..10]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_verification_requeues_once() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(fake_seeder(remote, true));

        let request = PieceRequest {
            index: 1,
            hash: sha1(&CONTENT[10..]),
            length: 8,
        };
        let queue = Arc::new(WorkQueue::new([request.clone()]));
        let (ctx, mut rx) = context(queue.clone());
        let mut session = session(local);

        let err = drive(&mut session, &ctx).await.unwrap_err();
        assert!(matches!(err, PeerError::Verification { index: 1 }));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.next_for(|_| true, Duration::from_millis(10)).await,
            NextWork::Piece(request)
        );
        drop(ctx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_choke_mid_piece_rerequests_missing_blocks() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        let mut session = session(local);
        write_message(&mut remote, &Message::Unchoke).await.unwrap();
        session.await_message().await.unwrap();

        let request = PieceRequest {
            index: 1,
            hash: sha1(&CONTENT[10..]),
            length: 8,
        };
        let peer = tokio::spawn(async move {
            // Two requests (pipeline of 2), answer one, choke, unchoke.
            let first = read_message(&mut remote).await.unwrap();
            let _second = read_message(&mut remote).await.unwrap();
            let Message::Request(first) = first else {
                panic!("expected request")
            };
            write_message(
                &mut remote,
                &Message::Piece {
                    index: 1,
                    begin: first.begin,
                    data: Bytes::copy_from_slice(&CONTENT[10..14]),
                },
            )
            .await
            .unwrap();
            write_message(&mut remote, &Message::Choke).await.unwrap();
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            let again = read_message(&mut remote).await.unwrap();
            let Message::Request(again) = again else {
                panic!("expected request")
            };
            assert_eq!(again.begin, 4);
            write_message(
                &mut remote,
                &Message::Piece {
                    index: 1,
                    begin: 4,
                    data: Bytes::copy_from_slice(&CONTENT[14..18]),
                },
            )
            .await
            .unwrap();
        });

        let data = download_piece(&mut session, &request, &config()).await.unwrap();
        assert_eq!(data, &CONTENT[10..]);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_when_peer_lacks_everything() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        let queue = Arc::new(WorkQueue::new(
            crate::piece::piece_requests(&torrent(), &Default::default()),
        ));
        let (ctx, _rx) = context(queue.clone());
        let mut session = session(local);

        tokio::spawn(async move {
            let _ = read_handshake(&mut remote).await;
            remote
                .write_all(&Handshake::new([3; 20], [9; 20]).encode())
                .await
                .unwrap();
            write_message(&mut remote, &Message::Bitfield(Bytes::from_static(&[0])))
                .await
                .unwrap();
            while read_message(&mut remote).await.is_ok() {}
        });

        drive(&mut session, &ctx).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_pieces_announced_by_have_are_downloaded() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let _ = read_handshake(&mut remote).await.unwrap();
            remote
                .write_all(&Handshake::new([3; 20], [9; 20]).encode())
                .await
                .unwrap();
            // No bitfield: the peer opens with unchoke and announces later.
            write_message(&mut remote, &Message::Unchoke).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            write_message(&mut remote, &Message::Have(0)).await.unwrap();
            write_message(&mut remote, &Message::Have(1)).await.unwrap();

            while let Ok(message) = read_message(&mut remote).await {
                if let Message::Request(block) = message {
                    let start = (block.index * 10 + block.begin) as usize;
                    let reply = Message::Piece {
                        index: block.index,
                        begin: block.begin,
                        data: Bytes::copy_from_slice(&CONTENT[start..start + block.length as usize]),
                    };
                    if write_message(&mut remote, &reply).await.is_err() {
                        return;
                    }
                }
            }
        });

        let queue = Arc::new(WorkQueue::new(
            crate::piece::piece_requests(&torrent(), &Default::default()),
        ));
        let (ctx, mut rx) = context(queue.clone());
        let mut session = session(local);

        drive(&mut session, &ctx).await.unwrap();
        drop(ctx);

        let mut received = Vec::new();
        while let Some(result) = rx.recv().await {
            received.push(result.index);
        }
        received.sort();
        assert_eq!(received, vec![0, 1]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_block_after_choke_frees_pipeline_slot() {
        let (local, mut remote) = tokio::io::duplex(1 << 16);
        let mut session = session(local);
        write_message(&mut remote, &Message::Unchoke).await.unwrap();
        session.await_message().await.unwrap();

        let request = PieceRequest {
            index: 1,
            hash: sha1(&CONTENT[10..]),
            length: 8,
        };
        let config = Config {
            max_pipeline: 1,
            ..config()
        };
        let block = |begin: usize| Message::Piece {
            index: 1,
            begin: begin as u32,
            data: Bytes::copy_from_slice(&CONTENT[10 + begin..14 + begin]),
        };

        let peer = tokio::spawn(async move {
            let Message::Request(first) = read_message(&mut remote).await.unwrap() else {
                panic!("expected request")
            };
            assert_eq!(first.begin, 0);
            // The original answer arrives while choked, then the re-request
            // is answered again.
            write_message(&mut remote, &Message::Choke).await.unwrap();
            write_message(&mut remote, &block(0)).await.unwrap();
            write_message(&mut remote, &Message::Unchoke).await.unwrap();

            let Message::Request(again) = read_message(&mut remote).await.unwrap() else {
                panic!("expected request")
            };
            assert_eq!(again.begin, 0);
            write_message(&mut remote, &block(0)).await.unwrap();

            let Message::Request(last) = read_message(&mut remote).await.unwrap() else {
                panic!("expected request")
            };
            assert_eq!(last.begin, 4);
            write_message(&mut remote, &block(4)).await.unwrap();
        });

        let data = download_piece(&mut session, &request, &config).await.unwrap();
        assert_eq!(data, &CONTENT[10..]);
        peer.await.unwrap();
    }
}
