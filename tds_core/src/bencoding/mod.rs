//! Bencode values and the decoder used for `.torrent` files and tracker replies.

pub mod decoder;
pub mod info_hash;
pub mod value;

pub use decoder::{BencodeError, Decoder, MAX_DEPTH, decode};
pub use info_hash::info_hash;
pub use value::Bencode;
