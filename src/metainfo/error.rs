use thiserror::Error;

/// Errors from parsing metainfo, info dictionaries, or magnet links.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The `pieces` string is not a multiple of 20 bytes.
    #[error("pieces length not a multiple of 20")]
    BadPiecesLength,

    /// An info hash that is not 20 bytes / 40 hex characters.
    #[error("invalid info hash")]
    BadInfoHash,

    #[error("invalid magnet link: {0}")]
    BadMagnetLink(String),
}
