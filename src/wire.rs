//! BitTorrent peer wire protocol framing (BEP-3, BEP-6, BEP-10).
//!
//! Messages are length-prefixed: a 4-byte big-endian length, then a
//! 1-byte type id and payload. A zero-length frame is a keep-alive.
//! [`MessageCodec`] turns a byte stream into [`Message`] values and back;
//! frames above [`MAX_FRAME_LEN`] are a fatal protocol error.

mod codec;
mod error;
mod message;

#[cfg(test)]
mod tests;

pub use codec::{MessageCodec, MAX_FRAME_LEN};
pub use error::WireError;
pub use message::{Message, MessageId};
