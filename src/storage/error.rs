use thiserror::Error;

/// Errors crossing the storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write outside the torrent's byte range.
    #[error("offset {offset} out of bounds (total {total})")]
    OutOfBounds { offset: u64, total: u64 },

    /// The back-end refused to commit a verified piece.
    #[error("piece {0} commit rejected: {1}")]
    CommitRejected(u32, String),

    /// A cache back-end is out of budget.
    #[error("storage capacity exhausted")]
    CapacityExhausted,
}
