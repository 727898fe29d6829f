use bytes::Bytes;

/// One bit per piece, high bit of the first byte is piece 0.
///
/// The length always matches the torrent's piece count: short payloads are
/// zero-extended, and bits past the last piece are cleared so a peer can
/// never claim pieces that do not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Interprets a `bitfield` message payload.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Self {
        let mut bits = payload.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);
        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    pub fn has(&self, index: u32) -> bool {
        let index = index as usize;
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: u32) {
        let index = index as usize;
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
