use thiserror::Error;

/// Errors from the wire codec. All of these are fatal to the session
/// that produced them.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix above the frame ceiling.
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(u32),

    /// A message id this implementation does not know.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A frame whose payload is shorter than its message type requires.
    #[error("short payload for {0}")]
    ShortPayload(&'static str),

    /// The remote closed the stream.
    #[error("connection closed")]
    Closed,
}
