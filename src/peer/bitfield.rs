use bytes::Bytes;

/// Which pieces a side of the connection has, one bit per piece, the
/// high bit of byte zero being piece zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Interprets wire bytes. Returns `None` when the peer sent fewer
    /// bytes than the piece count requires; oversized bitfields are
    /// truncated, matching what most clients tolerate.
    pub fn from_wire(bytes: &Bytes, num_pieces: usize) -> Option<Self> {
        let needed = num_pieces.div_ceil(8);
        if bytes.len() < needed {
            return None;
        }
        let mut field = Self {
            bits: bytes[..needed].to_vec(),
            num_pieces,
        };
        field.mask_spare_bits();
        Some(field)
    }

    pub fn full(num_pieces: usize) -> Self {
        let mut field = Self {
            bits: vec![0xff; num_pieces.div_ceil(8)],
            num_pieces,
        };
        field.mask_spare_bits();
        field
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Grows the field to hold `num_pieces`, for peers advertising
    /// pieces before we know the torrent's layout.
    pub fn grow(&mut self, num_pieces: usize) {
        if num_pieces > self.num_pieces {
            self.num_pieces = num_pieces;
            self.bits.resize(num_pieces.div_ceil(8), 0);
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.num_pieces > 0 && self.count() == self.num_pieces
    }

    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(|&i| self.has(i))
    }

    pub fn to_wire(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.num_pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}
