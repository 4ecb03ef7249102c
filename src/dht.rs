//! DHT boundary.
//!
//! The DHT server itself lives outside the core; the swarm only needs
//! two things from it: "announce this infohash and stream me peers"
//! and "ping this node so it joins the table". [`Dht`] is that
//! contract, and [`ChannelDht`] is a test double driven entirely
//! through channels.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::metainfo::InfoHash;

/// A stream of peer batches from one DHT announce traversal. The
/// channel closing means the traversal finished.
pub type PeerBatches = mpsc::Receiver<Vec<SocketAddr>>;

/// What the torrent coordinator requires of a DHT server.
pub trait Dht: Send + Sync {
    /// Starts announcing `info_hash` on `port` and returns a stream of
    /// discovered peer batches.
    fn announce(&self, info_hash: InfoHash, port: u16) -> PeerBatches;

    /// Pings a node address learned from a peer's `Port` message.
    fn ping(&self, addr: SocketAddr);

    /// The UDP port the DHT listens on, for our `Port` messages.
    fn port(&self) -> u16;
}

/// A channel-backed [`Dht`] for tests and for wiring an out-of-process
/// server: announces record what was asked and hand back a channel the
/// test (or adapter) feeds.
pub struct ChannelDht {
    port: u16,
    batch_capacity: usize,
    announces: Mutex<Vec<(InfoHash, u16, mpsc::Sender<Vec<SocketAddr>>)>>,
    pings: Mutex<Vec<SocketAddr>>,
}

impl ChannelDht {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            batch_capacity: 16,
            announces: Mutex::new(Vec::new()),
            pings: Mutex::new(Vec::new()),
        }
    }

    /// Senders for every announce made so far, most recent last.
    pub fn announce_feeds(&self) -> Vec<(InfoHash, u16, mpsc::Sender<Vec<SocketAddr>>)> {
        self.announces.lock().clone()
    }

    pub fn pings(&self) -> Vec<SocketAddr> {
        self.pings.lock().clone()
    }
}

impl Dht for ChannelDht {
    fn announce(&self, info_hash: InfoHash, port: u16) -> PeerBatches {
        let (tx, rx) = mpsc::channel(self.batch_capacity);
        self.announces.lock().push((info_hash, port, tx));
        rx
    }

    fn ping(&self, addr: SocketAddr) {
        self.pings.lock().push(addr);
    }

    fn port(&self) -> u16 {
        self.port
    }
}
