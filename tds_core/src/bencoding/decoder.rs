//! Recursive bencode decoder that remembers where the top-level `info`
//! dictionary sits in the input, so the info-hash can be taken over the
//! exact original bytes.

use super::value::Bencode;
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

/// Deepest list/dictionary nesting accepted before decoding gives up.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input while parsing {0}")]
    UnexpectedEof(&'static str),

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    #[error("invalid byte {byte:#04x} at position {pos}")]
    InvalidByte { byte: u8, pos: usize },

    #[error("dictionary key at byte {0} is not a byte string")]
    NonStringKey(usize),

    #[error("trailing data after value at byte {0}")]
    TrailingData(usize),

    #[error("nesting deeper than {MAX_DEPTH} levels at byte {0}")]
    TooDeep(usize),
}

/// Stateful decoder over a borrowed buffer.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            info_span: None,
        }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Raw bytes of the top-level `info` value, once decoded.
    pub fn info_bytes(&self) -> Option<&'a [u8]> {
        self.info_span.clone().map(|span| &self.input[span])
    }

    /// Decodes exactly one value and requires the input to end there.
    pub fn decode_all(&mut self) -> Result<Bencode, BencodeError> {
        let value = self.decode_value()?;
        if self.pos != self.input.len() {
            return Err(BencodeError::TrailingData(self.pos));
        }
        Ok(value)
    }

    pub fn decode_value(&mut self) -> Result<Bencode, BencodeError> {
        match self.peek("value")? {
            b'i' => self.decode_int(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            b'0'..=b'9' => self.decode_bytes().map(Bencode::Bytes),
            byte => Err(BencodeError::InvalidByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    fn peek(&self, what: &'static str) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(what))
    }

    fn take_until(&mut self, delim: u8, what: &'static str) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        let rel = self.input[start..]
            .iter()
            .position(|&b| b == delim)
            .ok_or(BencodeError::UnexpectedEof(what))?;
        self.pos = start + rel + 1;
        Ok(&self.input[start..start + rel])
    }

    fn decode_int(&mut self) -> Result<Bencode, BencodeError> {
        let start = self.pos;
        self.pos += 1;
        let digits = self.take_until(b'e', "integer")?;
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Bencode::Int)
            .ok_or(BencodeError::InvalidInteger(start))
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let len_digits = self.take_until(b':', "string length")?;
        let len = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidInteger(start))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::UnexpectedEof("byte string"))?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn enter(&mut self) -> Result<(), BencodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(BencodeError::TooDeep(self.pos));
        }
        self.pos += 1;
        self.depth += 1;
        Ok(())
    }

    fn decode_list(&mut self) -> Result<Bencode, BencodeError> {
        self.enter()?;
        let mut list = Vec::new();
        while self.peek("list")? != b'e' {
            list.push(self.decode_value()?);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(Bencode::List(list))
    }

    fn decode_dict(&mut self) -> Result<Bencode, BencodeError> {
        self.enter()?;
        let mut dict = BTreeMap::new();
        while self.peek("dictionary")? != b'e' {
            if !self.peek("dictionary key")?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey(self.pos));
            }
            let key = self.decode_bytes()?;
            let value_start = self.pos;
            let value = self.decode_value()?;
            if self.depth == 1 && key == b"info" {
                self.info_span = Some(value_start..self.pos);
            }
            dict.insert(key, value);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(Bencode::Dict(dict))
    }
}

/// Decodes one value starting at `*pos`, advancing it past the value.
pub fn decode(input: &[u8], pos: &mut usize) -> Result<Bencode, BencodeError> {
    let mut decoder = Decoder::new(input);
    decoder.pos = *pos;
    let value = decoder.decode_value()?;
    *pos = decoder.position();
    Ok(value)
}
