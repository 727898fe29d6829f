//! Piece and block arithmetic shared by the download and seeding sides,
//! plus reassembly of received blocks into a verified piece.

use crate::cache::ProgressCache;
use crate::error::PeerError;
use crate::peer::BlockInfo;
use sha1::{Digest, Sha1};
use tds_core::Torrent;

/// A unit of work on the shared queue: one whole piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceRequest {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
}

/// A downloaded piece whose hash matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

/// One request per piece not yet marked complete in `cache`.
pub fn piece_requests(torrent: &Torrent, cache: &ProgressCache) -> Vec<PieceRequest> {
    torrent
        .pieces
        .iter()
        .enumerate()
        .map(|(i, hash)| (i as u32, hash))
        .filter(|(index, _)| !cache.is_complete(*index))
        .map(|(index, hash)| PieceRequest {
            index,
            hash: *hash,
            length: torrent.piece_len(index) as u32,
        })
        .collect()
}

/// Blocks covering a piece of `piece_len` bytes, in increasing offset order.
pub fn blocks(index: u32, piece_len: u32, block_size: u32) -> impl Iterator<Item = BlockInfo> {
    (0..piece_len)
        .step_by(block_size as usize)
        .map(move |begin| BlockInfo {
            index,
            begin,
            length: block_size.min(piece_len - begin),
        })
}

/// Absolute file offset of byte `begin` within piece `index`.
pub fn absolute_offset(piece_length: u64, index: u32, begin: u32) -> u64 {
    index as u64 * piece_length + begin as u64
}

/// Shortens `length` so that `[start, start + length)` stays below `limit`.
/// `None` when `start` is already at or past the limit.
pub fn clamp_block(limit: u64, start: u64, length: u32) -> Option<u32> {
    if start >= limit {
        return None;
    }
    Some((limit - start).min(length as u64) as u32)
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Reassembly buffer for one piece.
///
/// Blocks are addressed by offset, so arrival order does not matter. Each
/// block slot is counted once; a repeated block is accepted but does not
/// advance progress.
pub struct PieceBuffer {
    index: u32,
    block_size: u32,
    data: Vec<u8>,
    filled: Vec<bool>,
    received: usize,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        Self {
            index,
            block_size,
            data: vec![0; length as usize],
            filled: vec![false; length.div_ceil(block_size) as usize],
            received: 0,
        }
    }

    /// Copies a block into place. Returns whether the block was new.
    pub fn insert(&mut self, begin: u32, block: &[u8]) -> Result<bool, PeerError> {
        let slot = (begin / self.block_size) as usize;
        let start = begin as usize;
        let expected = (self.data.len().saturating_sub(start)).min(self.block_size as usize);
        if begin % self.block_size != 0 || slot >= self.filled.len() || block.len() != expected {
            return Err(PeerError::Protocol(format!(
                "block at {begin} with {} bytes does not fit piece {} of {} bytes",
                block.len(),
                self.index,
                self.data.len()
            )));
        }
        if self.filled[slot] {
            return Ok(false);
        }
        self.data[start..start + block.len()].copy_from_slice(block);
        self.filled[slot] = true;
        self.received += block.len();
        Ok(true)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.filled.iter().all(|&f| f)
    }

    /// Blocks not yet received, in offset order.
    pub fn missing(&self) -> Vec<BlockInfo> {
        blocks(self.index, self.data.len() as u32, self.block_size)
            .zip(&self.filled)
            .filter(|(_, filled)| !**filled)
            .map(|(block, _)| block)
            .collect()
    }

    /// Hands back the piece if every block is present and the hash matches.
    pub fn finish(self, expected: &[u8; 20]) -> Result<Vec<u8>, PeerError> {
        if !self.is_complete() || sha1(&self.data) != *expected {
            return Err(PeerError::Verification { index: self.index });
        }
        Ok(self.data)
    }
}
