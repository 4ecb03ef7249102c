use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::StorageError;
use super::{Capacity, PieceCompletion, Storage};

/// In-memory storage, mainly for tests and cache-style operation. An
/// optional [`Capacity`] handle makes it behave like a bounded piece
/// cache; an optional commit hook lets tests exercise the
/// rejected-completion path.
pub struct MemoryStorage {
    piece_length: u64,
    total_length: u64,
    pieces: Mutex<HashMap<u32, Vec<u8>>>,
    capacity: Option<Arc<Capacity>>,
    completion: Option<MemoryCompletion>,
}

type CommitHook = Box<dyn Fn(u32) -> Result<(), StorageError> + Send + Sync>;

pub struct MemoryCompletion {
    hook: CommitHook,
}

impl PieceCompletion for MemoryCompletion {
    fn piece_completed(&self, piece_index: u32) -> Result<(), StorageError> {
        (self.hook)(piece_index)
    }
}

impl MemoryStorage {
    pub fn new(piece_length: u64, total_length: u64) -> Self {
        Self {
            piece_length,
            total_length,
            pieces: Mutex::new(HashMap::new()),
            capacity: None,
            completion: None,
        }
    }

    pub fn with_capacity(mut self, capacity: Arc<Capacity>) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.completion = Some(MemoryCompletion { hook });
        self
    }

    fn piece_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start.min(self.total_length)).min(self.piece_length)
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if offset >= self.total_length {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.total_length - offset) as usize;
        let pieces = self.pieces.lock();
        let mut done = 0usize;
        while done < want {
            let at = offset + done as u64;
            let index = (at / self.piece_length) as u32;
            let within = (at % self.piece_length) as usize;
            let piece_len = self.piece_len(index) as usize;
            let n = (piece_len - within).min(want - done);
            match pieces.get(&index) {
                Some(data) => {
                    buf[done..done + n].copy_from_slice(&data[within..within + n]);
                }
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(done)
    }

    fn write_chunk(&self, piece_index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let piece_len = self.piece_len(piece_index) as usize;
        let end = begin as usize + data.len();
        if end > piece_len {
            return Err(StorageError::OutOfBounds {
                offset: piece_index as u64 * self.piece_length + end as u64,
                total: self.total_length,
            });
        }
        let mut pieces = self.pieces.lock();
        if !pieces.contains_key(&piece_index) {
            if let Some(capacity) = &self.capacity {
                if !capacity.try_consume(piece_len as u64) {
                    return Err(StorageError::CapacityExhausted);
                }
            }
            pieces.insert(piece_index, vec![0; piece_len]);
        }
        if let Some(buf) = pieces.get_mut(&piece_index) {
            buf[begin as usize..end].copy_from_slice(data);
        }
        Ok(())
    }

    fn completion(&self) -> Option<&dyn PieceCompletion> {
        self.completion
            .as_ref()
            .map(|c| c as &dyn PieceCompletion)
    }

    fn capacity(&self) -> Option<Arc<Capacity>> {
        self.capacity.clone()
    }
}
