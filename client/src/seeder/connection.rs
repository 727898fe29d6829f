//! Per-connection state machine of the seeding side.

use super::{MAX_REQUEST_LEN, Seeder};
use crate::error::{HandshakeError, PeerError};
use crate::peer::{
    BlockInfo, Handshake, Message, read_handshake, read_message, with_deadline, write_frame,
    write_message,
};
use crate::piece::{absolute_offset, clamp_block};
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where an incoming connection is in its setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeState {
    AwaitingHandshake,
    SendBitfield,
    AwaitingInterest,
    /// Answering requests. Carries a request that arrived before `interested`.
    Serving(Option<BlockInfo>),
}

impl Seeder {
    /// Drives one peer from handshake to the end of the connection.
    ///
    /// A peer with the wrong info hash is dropped before it learns anything
    /// about our pieces. A clean close by the peer ends the connection with
    /// `Ok`.
    pub async fn handle_connection<S>(
        self: Arc<Self>,
        mut stream: S,
        peer: String,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.config.read_timeout;
        let mut state = ServeState::AwaitingHandshake;
        loop {
            debug!(%peer, ?state, "serve state");
            state = match state {
                ServeState::AwaitingHandshake => {
                    let theirs = with_deadline(read_timeout, read_handshake(&mut stream)).await?;
                    if theirs.info_hash != self.torrent.info_hash {
                        return Err(HandshakeError::InfoHashMismatch {
                            expected: hex::encode(self.torrent.info_hash),
                            received: hex::encode(theirs.info_hash),
                        }
                        .into());
                    }
                    let ours = Handshake::new(self.torrent.info_hash, self.peer_id);
                    write_frame(&mut stream, &ours.encode()).await?;
                    ServeState::SendBitfield
                }
                ServeState::SendBitfield => {
                    let payload = self.availability.to_payload();
                    write_message(&mut stream, &Message::Bitfield(payload)).await?;
                    ServeState::AwaitingInterest
                }
                ServeState::AwaitingInterest => {
                    match with_deadline(read_timeout, read_message(&mut stream)).await? {
                        Message::Interested => {
                            write_message(&mut stream, &Message::Unchoke).await?;
                            ServeState::Serving(None)
                        }
                        Message::Request(block) => {
                            write_message(&mut stream, &Message::Unchoke).await?;
                            ServeState::Serving(Some(block))
                        }
                        other => {
                            debug!(%peer, ?other, "waiting for interest");
                            ServeState::AwaitingInterest
                        }
                    }
                }
                ServeState::Serving(early) => {
                    info!(%peer, "serving");
                    return match self.serve_requests(stream, early, &peer).await {
                        Err(PeerError::Closed) => Ok(()),
                        other => other,
                    };
                }
            };
        }
    }

    /// Splits the stream into a reader queuing requests and a responder
    /// answering them in order, so a slow disk or rate limit pushes back on
    /// the peer instead of piling up tasks.
    async fn serve_requests<S>(
        &self,
        stream: S,
        early: Option<BlockInfo>,
        peer: &str,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut file = File::open(&self.source).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<BlockInfo>(self.config.serve_queue.max(1));
        if let Some(block) = early {
            // Fresh channel with room for at least one.
            let _ = tx.try_send(block);
        }

        let read_timeout = self.config.read_timeout;
        let reading = async move {
            loop {
                match with_deadline(read_timeout, read_message(&mut reader)).await? {
                    Message::Request(block) => {
                        if tx.send(block).await.is_err() {
                            return Ok::<_, PeerError>(());
                        }
                    }
                    other => debug!(%peer, ?other, "ignoring message while serving"),
                }
            }
        };

        let responding = async {
            while let Some(block) = rx.recv().await {
                self.respond(&mut writer, &mut file, block, peer).await?;
            }
            Ok::<_, PeerError>(())
        };

        tokio::try_join!(reading, responding)?;
        Ok(())
    }

    /// Answers one request, or skips it when we cannot or will not serve it.
    async fn respond<W>(
        &self,
        writer: &mut W,
        file: &mut File,
        block: BlockInfo,
        peer: &str,
    ) -> Result<(), PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(length) = self.admit(block) else {
            debug!(%peer, ?block, "skipping request");
            return Ok(());
        };

        if let Some(limiter) = &self.limiter {
            let wait = limiter.lock().await.reserve(length as f64);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        let offset = absolute_offset(self.torrent.piece_length, block.index, block.begin);
        let mut data = vec![0u8; length as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut data).await?;

        let reply = Message::Piece {
            index: block.index,
            begin: block.begin,
            data: data.into(),
        };
        write_message(writer, &reply).await?;
        let total = self.uploaded.fetch_add(length as u64, Ordering::Relaxed) + length as u64;
        debug!(%peer, piece = block.index, begin = block.begin, length, total, "sent block");
        Ok(())
    }

    /// Length to send for `block`, clamped to the end of its piece, or
    /// `None` when the request must be skipped.
    fn admit(&self, block: BlockInfo) -> Option<u32> {
        if !self.availability.has(block.index)
            || block.length == 0
            || block.length > MAX_REQUEST_LEN
        {
            return None;
        }
        let piece_end =
            self.torrent.piece_offset(block.index) + self.torrent.piece_len(block.index);
        let start = absolute_offset(self.torrent.piece_length, block.index, block.begin);
        clamp_block(piece_end, start, block.length)
    }
}
