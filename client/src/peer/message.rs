//! Handshake and message framing.
//!
//! A message frame is a 4-byte big-endian length covering the kind byte and
//! payload. A zero length is a keep-alive. Kinds this crate does not know are
//! surfaced as [`Message::Unknown`] so the caller decides what to do.

use crate::error::{FrameError, HandshakeError, PeerError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL.len() + 8 + 20 + 20;
/// Largest frame accepted from the wire: a 1 MiB block plus piece header.
pub const MAX_FRAME_LEN: u32 = (1 << 20) + 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(HandshakeError::Malformed);
        }
        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&data[20..28]);
        handshake.info_hash.copy_from_slice(&data[28..48]);
        handshake.peer_id.copy_from_slice(&data[48..68]);
        Ok(handshake)
    }
}

/// A block sub-range of a piece, as carried by `request` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel(BlockInfo),
    Unknown { id: u8, payload: Bytes },
}

impl Message {
    /// Serializes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, MessageId::Choke as u8, 0),
            Message::Unchoke => put_header(&mut buf, MessageId::Unchoke as u8, 0),
            Message::Interested => put_header(&mut buf, MessageId::Interested as u8, 0),
            Message::NotInterested => put_header(&mut buf, MessageId::NotInterested as u8, 0),
            Message::Have(index) => {
                put_header(&mut buf, MessageId::Have as u8, 4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                put_header(&mut buf, MessageId::Bitfield as u8, bits.len());
                buf.put_slice(bits);
            }
            Message::Request(block) => put_block(&mut buf, MessageId::Request as u8, block),
            Message::Cancel(block) => put_block(&mut buf, MessageId::Cancel as u8, block),
            Message::Piece { index, begin, data } => {
                put_header(&mut buf, MessageId::Piece as u8, 8 + data.len());
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Unknown { id, payload } => {
                put_header(&mut buf, *id, payload.len());
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decodes the bytes that follow a length prefix.
    pub fn decode_frame(mut frame: Bytes) -> Result<Self, FrameError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = frame.get_u8();
        let Some(kind) = MessageId::from_u8(id) else {
            return Ok(Message::Unknown { id, payload: frame });
        };
        Ok(match kind {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                ensure_len(&frame, "have", 4)?;
                Message::Have(frame.get_u32())
            }
            MessageId::Bitfield => Message::Bitfield(frame),
            MessageId::Request => {
                ensure_len(&frame, "request", 12)?;
                Message::Request(get_block(&mut frame))
            }
            MessageId::Cancel => {
                ensure_len(&frame, "cancel", 12)?;
                Message::Cancel(get_block(&mut frame))
            }
            MessageId::Piece => {
                ensure_len(&frame, "piece", 8)?;
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: frame,
                }
            }
        })
    }
}

fn ensure_len(frame: &Bytes, kind: &'static str, len: usize) -> Result<(), FrameError> {
    if frame.len() < len {
        return Err(FrameError::ShortPayload {
            kind,
            len: frame.len(),
        });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, id: u8, payload_len: usize) {
    buf.reserve(5 + payload_len);
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(id);
}

fn put_block(buf: &mut BytesMut, id: u8, block: &BlockInfo) {
    put_header(buf, id, 12);
    buf.put_u32(block.index);
    buf.put_u32(block.begin);
    buf.put_u32(block.length);
}

fn get_block(frame: &mut Bytes) -> BlockInfo {
    BlockInfo {
        index: frame.get_u32(),
        begin: frame.get_u32(),
        length: frame.get_u32(),
    }
}

fn truncated(e: std::io::Error) -> PeerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated.into()
    } else {
        e.into()
    }
}

/// Reads one full 68-byte handshake.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PeerError::from(HandshakeError::Malformed)
        } else {
            e.into()
        }
    })?;
    Ok(Handshake::decode(&buf)?)
}

/// Reads one length-prefixed frame and decodes it.
///
/// A stream that ends cleanly on a frame boundary is [`PeerError::Closed`];
/// one that ends anywhere else is [`FrameError::Truncated`].
pub async fn read_message<R>(reader: &mut R) -> Result<Message, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let n = reader.read(&mut len_buf).await?;
    if n == 0 {
        return Err(PeerError::Closed);
    }
    reader.read_exact(&mut len_buf[n..]).await.map_err(truncated)?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len).into());
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await.map_err(truncated)?;
    Ok(Message::decode_frame(Bytes::from(frame))?)
}

/// Takes one complete frame off the front of `buf` and decodes it.
///
/// Returns `None` while the frame is still incomplete, leaving `buf`
/// untouched so more bytes can be appended.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Message>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut frame = buf.split_to(total);
    frame.advance(4);
    Message::decode_frame(frame.freeze()).map(Some)
}

/// Writes already-encoded bytes and flushes them.
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one frame and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()).await
}
