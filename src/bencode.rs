//! Bencode tree model (BEP-3).
//!
//! The core treats bencode as a self-describing tree: [`Value`] is the
//! tree, [`from_bytes`] and [`to_bytes`] are the codec. Dictionaries keep
//! their keys sorted so encoding is canonical, which matters because info
//! dictionaries are hashed byte-for-byte.

mod codec;
mod error;
mod value;

#[cfg(test)]
mod tests;

pub use codec::{from_bytes, to_bytes, value_len};
pub use error::BencodeError;
pub use value::Value;
