use thiserror::Error;

/// Errors scoped to one peer session. Everything here closes the
/// session; whether the peer gets retried is the coordinator's call.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    /// The 68-byte handshake didn't parse or didn't match.
    #[error("invalid handshake")]
    BadHandshake,

    /// The peer named a torrent we don't serve.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A state transition the protocol forbids (second bitfield,
    /// conflicting have-all, oversized request).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("extension error: {0}")]
    Extension(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}
