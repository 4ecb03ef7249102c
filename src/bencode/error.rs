use thiserror::Error;

/// Errors produced while decoding bencode data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("truncated value")]
    Truncated,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    /// A malformed integer (empty, leading zeros, or not a number).
    #[error("malformed integer")]
    BadInteger,

    /// A string length prefix that is not a number.
    #[error("malformed string length")]
    BadLength,

    /// A dictionary key that is not a byte string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// Values nested deeper than the decoder allows.
    #[error("nesting too deep")]
    TooDeep,

    /// Bytes left over after the first complete value.
    #[error("trailing data after value")]
    TrailingData,
}
