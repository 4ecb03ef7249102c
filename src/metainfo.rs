//! Torrent metainfo: info dictionaries, info hashes, and magnet links.
//!
//! A torrent is identified by the SHA-1 of its bencoded info dictionary.
//! [`Metainfo`] is the parsed `.torrent` file; [`Info`] is the piece
//! layout; [`MagnetLink`] carries only the [`InfoHash`] plus optional
//! trackers and a display name, the starting point of the magnet
//! lifecycle.

mod error;
mod info;
mod info_hash;
mod magnet;

#[cfg(test)]
mod tests;

pub use error::MetainfoError;
pub use info::{FileEntry, Info, Metainfo};
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
