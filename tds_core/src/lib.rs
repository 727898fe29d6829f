//! Core library for the TDS BitTorrent client.
//!
//! Provides bencode decoding, `.torrent` parsing into a single-file
//! [`Torrent`] descriptor, and the piece arithmetic every other crate in the
//! workspace shares.

pub mod bencoding;
pub mod rate_limit;

use bencoding::{Bencode, BencodeError, Decoder, info_hash};
pub use rate_limit::TokenBucket;
use std::path::Path;
use thiserror::Error;

/// Errors produced while turning bytes into a [`Torrent`].
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bencode: {0}")]
    Bencode(#[from] BencodeError),

    #[error("torrent root is not a dictionary")]
    NotADictionary,

    #[error("missing or invalid field `{0}`")]
    MissingField(&'static str),

    #[error("multi-file torrents are not supported")]
    MultiFile,

    #[error("piece hashes length {0} is not a multiple of 20")]
    InvalidPieces(usize),

    #[error("{hashes} piece hashes do not cover {length} bytes at piece length {piece_length}")]
    PieceCountMismatch {
        hashes: usize,
        length: u64,
        piece_length: u64,
    },
}

/// Metadata of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    /// The URL of the primary tracker.
    pub announce: String,
    /// Optional list of backup trackers (tier-based).
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The SHA-1 hash of the info dictionary.
    pub info_hash: [u8; 20],
    /// The length of a single piece in bytes.
    pub piece_length: u64,
    /// The list of SHA-1 hashes for each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Suggested file name.
    pub name: String,
    /// Total length of the file.
    pub length: u64,
}

impl Torrent {
    /// Builds a descriptor and checks that the hashes cover `length` exactly.
    pub fn new(
        name: impl Into<String>,
        info_hash: [u8; 20],
        piece_length: u64,
        length: u64,
        pieces: Vec<[u8; 20]>,
    ) -> Result<Self, MetainfoError> {
        let torrent = Self {
            announce: String::new(),
            announce_list: None,
            info_hash,
            piece_length,
            pieces,
            name: name.into(),
            length,
        };
        torrent.validate()?;
        Ok(torrent)
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::MissingField("piece length"));
        }
        if self.length.div_ceil(self.piece_length) != self.pieces.len() as u64 {
            return Err(MetainfoError::PieceCountMismatch {
                hashes: self.pieces.len(),
                length: self.length,
                piece_length: self.piece_length,
            });
        }
        Ok(())
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte offset of the first byte of piece `index` in the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// Length of piece `index`; only the last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> u64 {
        let start = self.piece_offset(index);
        self.length.saturating_sub(start).min(self.piece_length)
    }

    /// Every tracker URL, primary first, without duplicates.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if !self.announce.is_empty() {
            urls.push(self.announce.clone());
        }
        for url in self.announce_list.iter().flatten().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

/// Parses a `.torrent` file from the disk.
pub fn parse_torrent(path: impl AsRef<Path>) -> Result<Torrent, MetainfoError> {
    let buf = std::fs::read(path)?;
    parse_torrent_from_bytes(&buf)
}

/// Parses a torrent from a byte slice.
pub fn parse_torrent_from_bytes(buf: &[u8]) -> Result<Torrent, MetainfoError> {
    let mut decoder = Decoder::new(buf);
    let root = decoder.decode_all()?;
    if !matches!(root, Bencode::Dict(_)) {
        return Err(MetainfoError::NotADictionary);
    }
    let info_bytes = decoder
        .info_bytes()
        .ok_or(MetainfoError::MissingField("info"))?;
    let info = root.get(b"info").ok_or(MetainfoError::MissingField("info"))?;

    let announce = root
        .get(b"announce")
        .and_then(Bencode::as_string)
        .unwrap_or_default();

    let announce_list = root
        .get(b"announce-list")
        .and_then(Bencode::as_list)
        .map(|tiers| {
            tiers
                .iter()
                .filter_map(Bencode::as_list)
                .map(|urls| urls.iter().filter_map(Bencode::as_string).collect::<Vec<_>>())
                .filter(|tier| !tier.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|tiers| !tiers.is_empty());

    if info.get(b"files").is_some() {
        return Err(MetainfoError::MultiFile);
    }

    let name = info
        .get(b"name")
        .and_then(Bencode::as_string)
        .ok_or(MetainfoError::MissingField("name"))?;

    let piece_length = info
        .get(b"piece length")
        .and_then(Bencode::as_int)
        .filter(|&n| n > 0)
        .ok_or(MetainfoError::MissingField("piece length"))? as u64;

    let length = info
        .get(b"length")
        .and_then(Bencode::as_int)
        .filter(|&n| n >= 0)
        .ok_or(MetainfoError::MissingField("length"))? as u64;

    let pieces_bytes = info
        .get(b"pieces")
        .and_then(Bencode::as_bytes)
        .ok_or(MetainfoError::MissingField("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidPieces(pieces_bytes.len()));
    }
    let pieces = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let torrent = Torrent {
        announce,
        announce_list,
        info_hash: info_hash(info_bytes),
        piece_length,
        pieces,
        name,
        length,
    };
    torrent.validate()?;
    Ok(torrent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dummy_torrent(length: i64, piece_length: i64, hashes: usize) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::Int(length));
        info.insert(b"name".to_vec(), Bencode::Bytes(b"testfile".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::Int(piece_length));
        info.insert(b"pieces".to_vec(), Bencode::Bytes(vec![b'X'; 20 * hashes]));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Bencode::Bytes(b"http://track.er".to_vec()),
        );
        root.insert(b"info".to_vec(), Bencode::Dict(info));
        Bencode::Dict(root).encode()
    }

    #[test]
    fn test_parse_simple_torrent() {
        let buf = dummy_torrent(12345, 16384, 1);
        let t = parse_torrent_from_bytes(&buf).expect("Should parse");
        assert_eq!(t.announce, "http://track.er");
        assert_eq!(t.name, "testfile");
        assert_eq!(t.length, 12345);
        assert_eq!(t.piece_length, 16384);
        assert_eq!(t.piece_count(), 1);
        assert_eq!(t.tracker_urls(), vec!["http://track.er".to_string()]);
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        let buf = dummy_torrent(20, 10, 2);
        let t = parse_torrent_from_bytes(&buf).unwrap();
        let start = buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let raw_info = &buf[start..buf.len() - 1];
        assert_eq!(t.info_hash, info_hash(raw_info));
    }

    #[test]
    fn test_piece_count_mismatch_is_rejected() {
        let buf = dummy_torrent(30, 10, 2);
        assert!(matches!(
            parse_torrent_from_bytes(&buf),
            Err(MetainfoError::PieceCountMismatch { hashes: 2, .. })
        ));
    }

    #[test]
    fn test_piece_lengths_sum_to_total() {
        let t = Torrent::new("f", [0; 20], 10, 18, vec![[0; 20]; 2]).unwrap();
        assert_eq!(t.piece_len(0), 10);
        assert_eq!(t.piece_len(1), 8);
        assert_eq!(t.piece_offset(1), 10);
        let sum: u64 = (0..t.piece_count() as u32).map(|i| t.piece_len(i)).sum();
        assert_eq!(sum, t.length);
    }

    #[test]
    fn test_parse_invalid_torrent() {
        assert!(parse_torrent_from_bytes(b"invalid").is_err());
        assert!(matches!(
            parse_torrent_from_bytes(b"li1ee"),
            Err(MetainfoError::NotADictionary)
        ));
    }
}
