//! Storage back-end boundary.
//!
//! The core only ever needs a byte-range contract: read at an absolute
//! offset, write a chunk into a piece, and a few optional capabilities
//! that are probed explicitly through [`Storage`] accessors rather than
//! downcasts. Back-ends that cache rather than persist expose a shared
//! [`Capacity`] so the request scheduler can budget across torrents.

mod error;
mod file;
mod memory;

#[cfg(test)]
mod tests;

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::metainfo::Info;

/// Byte-range storage for one torrent.
///
/// `read_at` and `write_chunk` are mandatory; the rest are optional
/// capabilities a back-end may or may not have. Callers probe them
/// through the accessors and must tolerate `None`.
pub trait Storage: Send + Sync {
    /// Reads into `buf` at an absolute offset into the torrent's data.
    /// Short reads are allowed; zero means end of data.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Writes one received chunk at `begin` bytes into piece
    /// `piece_index`.
    fn write_chunk(&self, piece_index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Post-verification hook. A back-end that commits pieces (to a db,
    /// a cache with eviction) may reject, in which case the piece
    /// reverts to pending and will be fetched and hashed again.
    fn completion(&self) -> Option<&dyn PieceCompletion> {
        None
    }

    /// Shared byte budget, for cache-like back-ends. Torrents returning
    /// the same handle compete for the same budget in the scheduler.
    fn capacity(&self) -> Option<Arc<Capacity>> {
        None
    }

    /// Streaming access for readers that outlive a single `read_at`.
    fn open_section(
        &self,
        _offset: u64,
        _length: u64,
    ) -> Result<Option<Box<dyn Read + Send>>, StorageError> {
        Ok(None)
    }
}

/// The optional piece-commit capability.
pub trait PieceCompletion: Send + Sync {
    fn piece_completed(&self, piece_index: u32) -> Result<(), StorageError>;
}

/// Opens storage for a torrent once its info dictionary is known; the
/// client carries one of these from configuration.
pub type StorageFactory =
    Arc<dyn Fn(&Info) -> Result<Arc<dyn Storage>, StorageError> + Send + Sync>;

/// A shared storage byte budget. Identity (the `Arc` pointer) keys the
/// scheduler's per-pass accounting, so several torrents backed by one
/// cache fight over a single number.
#[derive(Debug)]
pub struct Capacity {
    limit: u64,
    used: AtomicU64,
}

impl Capacity {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used.load(Ordering::Acquire))
    }

    /// Claims `bytes` if they fit.
    pub fn try_consume(&self, bytes: u64) -> bool {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + bytes > self.limit {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}
