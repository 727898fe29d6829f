//! Download-side view of one peer connection.

use super::message::{
    BlockInfo, Handshake, Message, parse_frame, read_handshake, write_frame, write_message,
};
use super::{Bitfield, with_deadline};
use crate::config::Config;
use crate::error::{FrameError, HandshakeError, PeerError};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tds_core::Torrent;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Whether the remote peer is currently refusing our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeState {
    Choked,
    Unchoked,
}

/// Whether we have told the remote peer we want its pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestState {
    NotInterested,
    Interested,
}

/// A connection plus everything observed about the remote end.
///
/// Owned by exactly one worker. State only changes through the `on_*`
/// transitions, which [`PeerSession::await_message`] applies for each
/// message it reads.
pub struct PeerSession<S> {
    stream: S,
    /// Bytes read past the last complete frame.
    read_buf: BytesMut,
    name: String,
    info_hash: [u8; 20],
    local_id: [u8; 20],
    remote_id: Option<[u8; 20]>,
    bitfield: Bitfield,
    choke: ChokeState,
    interest: InterestState,
    read_timeout: Duration,
}

impl PeerSession<TcpStream> {
    pub async fn connect(
        addr: SocketAddr,
        torrent: &Torrent,
        local_id: [u8; 20],
        config: &Config,
    ) -> Result<Self, PeerError> {
        let stream = with_deadline(config.connect_timeout, async {
            Ok(TcpStream::connect(addr).await?)
        })
        .await?;
        Ok(Self::new(
            stream,
            addr.to_string(),
            torrent,
            local_id,
            config.read_timeout,
        ))
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        name: String,
        torrent: &Torrent,
        local_id: [u8; 20],
        read_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            name,
            info_hash: torrent.info_hash,
            local_id,
            remote_id: None,
            bitfield: Bitfield::new(torrent.piece_count()),
            choke: ChokeState::Choked,
            interest: InterestState::NotInterested,
            read_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_id(&self) -> Option<[u8; 20]> {
        self.remote_id
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    pub fn choke_state(&self) -> ChokeState {
        self.choke
    }

    pub fn interest_state(&self) -> InterestState {
        self.interest
    }

    pub fn is_choked(&self) -> bool {
        self.choke == ChokeState::Choked
    }

    /// Sends our handshake, then reads and validates the peer's.
    pub async fn handshake(&mut self) -> Result<Handshake, PeerError> {
        let ours = Handshake::new(self.info_hash, self.local_id);
        write_frame(&mut self.stream, &ours.encode()).await?;

        let theirs = with_deadline(self.read_timeout, read_handshake(&mut self.stream)).await?;
        if theirs.info_hash != self.info_hash {
            return Err(HandshakeError::InfoHashMismatch {
                expected: hex::encode(self.info_hash),
                received: hex::encode(theirs.info_hash),
            }
            .into());
        }
        self.remote_id = Some(theirs.peer_id);
        debug!(peer = %self.name, remote_id = %String::from_utf8_lossy(&theirs.peer_id), "handshake complete");
        Ok(theirs)
    }

    /// Reads the first frame after the handshake as the peer's bitfield.
    ///
    /// Peers that open with anything else are treated as having nothing yet;
    /// the message is still applied so a leading `have` or `unchoke` counts.
    pub async fn read_bitfield(&mut self) -> Result<&Bitfield, PeerError> {
        let first = with_deadline(self.read_timeout, self.read_frame()).await?;
        if !matches!(first, Message::Bitfield(_)) {
            debug!(peer = %self.name, ?first, "peer opened without a bitfield");
        }
        self.apply(&first);
        Ok(&self.bitfield)
    }

    pub async fn send_unchoke(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Unchoke).await
    }

    pub async fn send_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Interested).await?;
        self.interest = InterestState::Interested;
        Ok(())
    }

    pub async fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        self.send(&Message::Have(index)).await
    }

    pub async fn request_block(&mut self, block: BlockInfo) -> Result<(), PeerError> {
        self.send(&Message::Request(block)).await
    }

    /// Reads one message under the read deadline and applies its state
    /// transition before handing it back.
    pub async fn await_message(&mut self) -> Result<Message, PeerError> {
        with_deadline(self.read_timeout, self.next_message()).await
    }

    /// Like [`PeerSession::await_message`] but without a deadline.
    ///
    /// Cancel safe: partially received frames stay buffered in the session,
    /// so this can race other futures in `select!`.
    pub async fn next_message(&mut self) -> Result<Message, PeerError> {
        let message = self.read_frame().await?;
        self.apply(&message);
        Ok(message)
    }

    async fn read_frame(&mut self) -> Result<Message, PeerError> {
        loop {
            if let Some(message) = parse_frame(&mut self.read_buf)? {
                return Ok(message);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(if self.read_buf.is_empty() {
                    PeerError::Closed
                } else {
                    FrameError::Truncated.into()
                });
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        write_message(&mut self.stream, message).await
    }

    fn apply(&mut self, message: &Message) {
        match message {
            Message::Choke => self.on_choke(),
            Message::Unchoke => self.on_unchoke(),
            Message::Have(index) => self.on_have(*index),
            Message::Bitfield(payload) => self.on_bitfield(payload),
            _ => {}
        }
    }

    fn on_choke(&mut self) {
        self.choke = ChokeState::Choked;
    }

    fn on_unchoke(&mut self) {
        self.choke = ChokeState::Unchoked;
    }

    fn on_have(&mut self, index: u32) {
        self.bitfield.set(index);
    }

    fn on_bitfield(&mut self, payload: &[u8]) {
        self.bitfield = Bitfield::from_payload(payload, self.bitfield.piece_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::read_message;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn torrent() -> Torrent {
        Torrent::new("t", [7; 20], 10, 18, vec![[0; 20]; 2]).unwrap()
    }

    fn session(stream: DuplexStream) -> PeerSession<DuplexStream> {
        PeerSession::new(
            stream,
            "test-peer".into(),
            &torrent(),
            [1; 20],
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_handshake_accepts_matching_hash() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = session(local);
        remote
            .write_all(&Handshake::new([7; 20], [9; 20]).encode())
            .await
            .unwrap();

        let theirs = session.handshake().await.unwrap();
        assert_eq!(theirs.peer_id, [9; 20]);
        assert_eq!(session.remote_id(), Some([9; 20]));

        let mut sent = [0u8; 68];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(Handshake::decode(&sent).unwrap().peer_id, [1; 20]);
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_info_hash() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = session(local);
        remote
            .write_all(&Handshake::new([8; 20], [9; 20]).encode())
            .await
            .unwrap();
        assert!(matches!(
            session.handshake().await,
            Err(PeerError::Handshake(HandshakeError::InfoHashMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_non_bitfield_first_message_means_empty() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = session(local);
        write_message(&mut remote, &Message::Unchoke).await.unwrap();
        let bitfield = session.read_bitfield().await.unwrap();
        assert_eq!(bitfield.count(), 0);
        assert!(!session.is_choked());
    }

    #[tokio::test]
    async fn test_transitions_from_messages() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = session(local);
        write_message(&mut remote, &Message::Bitfield(Bytes::from_static(&[0b1000_0000])))
            .await
            .unwrap();
        write_message(&mut remote, &Message::Have(1)).await.unwrap();
        write_message(&mut remote, &Message::Unchoke).await.unwrap();
        write_message(&mut remote, &Message::Choke).await.unwrap();

        session.read_bitfield().await.unwrap();
        assert!(session.has_piece(0) && !session.has_piece(1));
        session.await_message().await.unwrap();
        assert!(session.has_piece(1));
        session.await_message().await.unwrap();
        assert_eq!(session.choke_state(), ChokeState::Unchoked);
        session.await_message().await.unwrap();
        assert_eq!(session.choke_state(), ChokeState::Choked);

        session.send_interested().await.unwrap();
        assert_eq!(session.interest_state(), InterestState::Interested);
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Interested);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (local, _remote) = tokio::io::duplex(1024);
        let mut session = PeerSession::new(
            local,
            "slow".into(),
            &torrent(),
            [1; 20],
            Duration::from_millis(20),
        );
        assert!(matches!(
            session.await_message().await,
            Err(PeerError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_interrupted_read_keeps_partial_frame() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = session(local);
        let wire = Message::Have(1).encode();

        remote.write_all(&wire[..6]).await.unwrap();
        let interrupted =
            tokio::time::timeout(Duration::from_millis(20), session.next_message()).await;
        assert!(interrupted.is_err());

        remote.write_all(&wire[6..]).await.unwrap();
        assert_eq!(session.next_message().await.unwrap(), Message::Have(1));
        assert!(session.has_piece(1));
    }
}
