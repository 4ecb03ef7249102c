//! Peer sessions: the BitTorrent handshake, per-connection state
//! machine, and the outgoing message queue.
//!
//! A session owns everything scoped to one remote connection. It
//! interprets incoming wire messages, keeps its own choke/interest and
//! request bookkeeping, and surfaces [`SessionEvent`]s for the torrent
//! coordinator to act on. Outgoing traffic goes through a non-blocking
//! [`session::PeerSession::post`] into a queue drained by a dedicated
//! writer task.

pub mod bitfield;
pub mod error;
pub mod extension;
pub mod handshake;
pub mod metadata;
pub mod peer_id;
pub mod session;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod tests;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::ExtensionHandshake;
pub use handshake::{exchange_handshake, Handshake, ReservedBits};
pub use metadata::{MetadataMessage, MetadataMessageType, METADATA_PIECE_SIZE};
pub use peer_id::PeerId;
pub use session::{Direction, PeerPieceState, PeerSession, SessionEvent};
pub use transport::{AsyncStream, BoxedStream, DialFuture, Rewound, StreamDialer, TransportKind};
pub use writer::MessageQueue;
