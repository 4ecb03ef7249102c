use thiserror::Error;

/// Errors from tracker announces.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL scheme names no transport we implement.
    #[error("unknown tracker scheme in {0}")]
    BadScheme(String),

    #[error("invalid tracker url: {0}")]
    BadUrl(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A response that parsed but violated the protocol.
    #[error("invalid response: {0}")]
    BadResponse(String),

    /// The tracker itself reported a failure reason.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("announce timed out")]
    Timeout,
}
