//! Piece state: chunk bookkeeping, download priorities, and the
//! reader-driven priority gradient.
//!
//! A piece is the unit of integrity (one SHA-1 hash each); a chunk is
//! the 16 KiB wire unit of transfer. Pieces track which chunks are still
//! pending, their hash-pipeline flags, and how many peers advertise them.

use std::collections::HashSet;

use crate::constants::CHUNK_SIZE;

/// A chunk's position within its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkSpec {
    pub begin: u32,
    pub length: u32,
}

/// A chunk request as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub index: u32,
    pub chunk: ChunkSpec,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            chunk: ChunkSpec { begin, length },
        }
    }
}

/// Download priority of a piece. Higher values sort earlier in the
/// request scheduler; `None` means the piece is not wanted (or already
/// verified).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PiecePriority {
    #[default]
    None = 0,
    Normal = 1,
    /// Within the reader's readahead window.
    Readahead = 2,
    /// The piece after the one being read.
    Next = 3,
    /// The piece currently being read from.
    Now = 4,
}

/// Per-piece download and verification state.
#[derive(Debug, Clone)]
pub struct Piece {
    pub hash: [u8; 20],
    pub length: u64,
    pub priority: PiecePriority,
    /// Chunk offsets not yet received. Empty plus a verified hash means
    /// the piece is complete.
    pub pending_chunks: HashSet<u32>,
    /// Number of connected peers advertising this piece.
    pub availability: i64,
    pub verified: bool,
    pub ever_hashed: bool,
    pub hashing: bool,
    pub queued_for_hash: bool,
}

impl Piece {
    pub fn new(hash: [u8; 20], length: u64) -> Self {
        Self {
            hash,
            length,
            priority: PiecePriority::None,
            pending_chunks: HashSet::new(),
            availability: 0,
            verified: false,
            ever_hashed: false,
            hashing: false,
            queued_for_hash: false,
        }
    }

    pub fn num_chunks(&self) -> u32 {
        self.length.div_ceil(CHUNK_SIZE as u64) as u32
    }

    /// The wire length of the chunk at `begin`; only the final chunk of
    /// the final piece is short.
    pub fn chunk_len(&self, begin: u32) -> u32 {
        (self.length - (begin as u64).min(self.length)).min(CHUNK_SIZE as u64) as u32
    }

    /// Marks every chunk pending again, as when a hash check fails.
    pub fn pend_all_chunks(&mut self) {
        self.pending_chunks = (0..self.num_chunks())
            .map(|i| i * CHUNK_SIZE as u32)
            .collect();
    }

    pub fn chunk_spec(&self, begin: u32) -> ChunkSpec {
        ChunkSpec {
            begin,
            length: self.chunk_len(begin),
        }
    }

    /// Pending chunks in offset order, as the scheduler consumes them.
    pub fn pending_chunk_specs(&self) -> Vec<ChunkSpec> {
        let mut begins: Vec<u32> = self.pending_chunks.iter().copied().collect();
        begins.sort_unstable();
        begins.into_iter().map(|b| self.chunk_spec(b)).collect()
    }

    /// A piece with some but not all chunks pending; finishing these
    /// first frees buffers and verifies sooner.
    pub fn is_partial(&self) -> bool {
        let pending = self.pending_chunks.len() as u32;
        pending != 0 && pending != self.num_chunks()
    }

    /// Whether the scheduler should consider this piece at all.
    pub fn wanted(&self) -> bool {
        self.priority != PiecePriority::None && !self.verified
    }

    /// Raises (never lowers) the priority.
    pub fn raise_priority(&mut self, priority: PiecePriority) -> bool {
        if !self.verified && priority > self.priority {
            self.priority = priority;
            true
        } else {
            false
        }
    }
}

/// Number of pieces to mark `Readahead` beyond the `Now` and `Next`
/// pieces for a reader window of `readahead` bytes.
pub fn readahead_pieces(readahead: u64, piece_length: u64) -> usize {
    (readahead.div_ceil(piece_length).saturating_sub(1)) as usize
}

/// The priority gradient a read at some offset imposes: the containing
/// piece, then the successor, then the readahead tail.
pub fn reader_priorities(
    read_piece: usize,
    num_pieces: usize,
    readahead: u64,
    piece_length: u64,
) -> Vec<(usize, PiecePriority)> {
    let mut out = Vec::new();
    if read_piece >= num_pieces {
        return out;
    }
    out.push((read_piece, PiecePriority::Now));
    if read_piece + 1 < num_pieces {
        out.push((read_piece + 1, PiecePriority::Next));
    }
    for i in 0..readahead_pieces(readahead, piece_length) {
        let index = read_piece + 2 + i;
        if index >= num_pieces {
            break;
        }
        out.push((index, PiecePriority::Readahead));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_layout() {
        let piece = Piece::new([0; 20], 40_000);
        assert_eq!(piece.num_chunks(), 3);
        assert_eq!(piece.chunk_len(0), 16384);
        assert_eq!(piece.chunk_len(16384), 16384);
        // 40_000 - 32768 = 7232
        assert_eq!(piece.chunk_len(32768), 7232);
    }

    #[test]
    fn test_pend_all_chunks() {
        let mut piece = Piece::new([0; 20], 40_000);
        piece.pend_all_chunks();
        assert_eq!(piece.pending_chunks.len(), 3);
        assert!(piece.pending_chunks.contains(&32768));
        assert!(!piece.is_partial());

        piece.pending_chunks.remove(&0);
        assert!(piece.is_partial());

        piece.pending_chunks.clear();
        assert!(!piece.is_partial());
    }

    #[test]
    fn test_priority_only_rises() {
        let mut piece = Piece::new([0; 20], 16384);
        assert!(piece.raise_priority(PiecePriority::Readahead));
        assert!(!piece.raise_priority(PiecePriority::Normal));
        assert_eq!(piece.priority, PiecePriority::Readahead);
        assert!(piece.raise_priority(PiecePriority::Now));

        piece.verified = true;
        assert!(!piece.raise_priority(PiecePriority::Now));
    }

    #[test]
    fn test_readahead_pieces() {
        // 5 MiB of readahead over 1 MiB pieces: Now + Next + 4 more.
        let mib = 1024 * 1024;
        assert_eq!(readahead_pieces(5 * mib, mib), 4);
        assert_eq!(readahead_pieces(mib, mib), 0);
        assert_eq!(readahead_pieces(mib + 1, mib), 1);
    }

    #[test]
    fn test_reader_priority_gradient() {
        let mib = 1024 * 1024;
        let grades = reader_priorities(3, 100, 5 * mib, mib);
        assert_eq!(
            grades,
            vec![
                (3, PiecePriority::Now),
                (4, PiecePriority::Next),
                (5, PiecePriority::Readahead),
                (6, PiecePriority::Readahead),
                (7, PiecePriority::Readahead),
                (8, PiecePriority::Readahead),
            ]
        );
    }

    #[test]
    fn test_reader_priorities_clamped_at_end() {
        let mib = 1024 * 1024;
        let grades = reader_priorities(99, 100, 5 * mib, mib);
        assert_eq!(grades, vec![(99, PiecePriority::Now)]);
    }
}
