//! shoal - a BitTorrent client core
//!
//! The crate covers the part of a BitTorrent client between the wire
//! and the disk: peer sessions speaking the BEP-3 protocol (with the
//! fast extension, the extension protocol, and MSE transport
//! encryption), a global chunk-request scheduler, per-torrent swarm
//! coordination from magnet link to verified download, and the piece
//! hashing pipeline. Storage back-ends, tracker transports, and the
//! DHT sit behind narrow adapter traits.
//!
//! # Modules
//!
//! - [`client`] - The client controller: registry, listeners, dialing
//! - [`torrent`] - Per-torrent swarm state and metadata acquisition
//! - [`peer`] - Peer wire sessions (BEP-3/6/9/10)
//! - [`scheduler`] - Global chunk-request assignment
//! - [`pieces`] - Piece state and reader-driven priorities
//! - [`wire`] - Message framing
//! - [`mse`] - Message Stream Encryption (BEP-8)
//! - [`tracker`] - HTTP and UDP announce clients (BEP-3/15)
//! - [`dht`] - The DHT boundary contract (BEP-5)
//! - [`pex`] - Peer exchange messages (BEP-11)
//! - [`storage`] - The storage boundary and built-in back-ends
//! - [`blocklist`] - IPv4 range blocklist with a packed format
//! - [`metainfo`] - Torrent files, info hashes, magnet links
//! - [`bencode`] - The bencode tree model

pub mod bencode;
pub mod blocklist;
pub mod client;
pub mod config;
pub mod constants;
pub mod dht;
pub mod metainfo;
pub mod mse;
pub mod peer;
pub mod pex;
pub mod pieces;
pub mod scheduler;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use blocklist::Blocklist;
pub use client::{Client, ClientError, TorrentHandle, TorrentSpec};
pub use config::ClientConfig;
pub use dht::Dht;
pub use metainfo::{InfoHash, MagnetLink, Metainfo};
pub use peer::PeerId;
pub use storage::{Capacity, Storage, StorageFactory};
