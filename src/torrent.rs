//! Per-torrent swarm state: the piece map, known and connected peers,
//! half-open dials, metadata acquisition, and tracker tiers.
//!
//! A torrent starts from nothing but an infohash (the magnet case) and
//! becomes active once its info dictionary arrives and verifies. All
//! mutable state sits behind one lock per torrent; the client
//! controller drives the async loops and takes the lock for short
//! synchronous sections.

mod state;


pub(crate) use state::{ConnHandle, PeerSource, TorrentState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Notify};

use crate::metainfo::InfoHash;

/// The shared core of one torrent: its state under a lock, plus the
/// lifecycle signals the async loops select on.
pub(crate) struct TorrentShared {
    pub info_hash: InfoHash,
    /// Tie-break of last resort in the scheduler's piece order.
    pub stable_id: usize,
    pub max_unverified_bytes: u64,

    pub state: RwLock<TorrentState>,

    /// Broadcast on any state change that could release a waiter.
    pub event: Notify,
    /// Kicked when the announce loops should look for peers again.
    pub want_peers: Notify,

    closing_tx: watch::Sender<bool>,
    pub closing: watch::Receiver<bool>,
    got_metainfo_tx: watch::Sender<bool>,
    pub got_metainfo: watch::Receiver<bool>,
    ceasing_networking_tx: watch::Sender<bool>,
    pub ceasing_networking: watch::Receiver<bool>,

    metainfo_cached: AtomicBool,
}

impl TorrentShared {
    pub fn new(info_hash: InfoHash, stable_id: usize, max_unverified_bytes: u64) -> Arc<Self> {
        let (closing_tx, closing) = watch::channel(false);
        let (got_metainfo_tx, got_metainfo) = watch::channel(false);
        let (ceasing_networking_tx, ceasing_networking) = watch::channel(false);
        Arc::new(Self {
            info_hash,
            stable_id,
            max_unverified_bytes,
            state: RwLock::new(TorrentState::new()),
            event: Notify::new(),
            want_peers: Notify::new(),
            closing_tx,
            closing,
            got_metainfo_tx,
            got_metainfo,
            ceasing_networking_tx,
            ceasing_networking,
            metainfo_cached: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    pub fn close(&self) {
        let _ = self.closing_tx.send(true);
        let _ = self.ceasing_networking_tx.send(true);
        self.event.notify_waiters();
        self.want_peers.notify_waiters();
    }

    pub fn has_metainfo(&self) -> bool {
        *self.got_metainfo.borrow()
    }

    pub fn announce_metainfo(&self) {
        let _ = self.got_metainfo_tx.send(true);
        self.event.notify_waiters();
    }

    pub fn is_ceasing_networking(&self) -> bool {
        *self.ceasing_networking.borrow()
    }

    /// Called when upload and download are both finished and uploading
    /// is off: the announce loops unwind.
    pub fn cease_networking(&self) {
        let _ = self.ceasing_networking_tx.send(true);
        self.want_peers.notify_waiters();
    }

    /// One-shot latch around writing the metainfo cache file.
    pub fn mark_metainfo_cached(&self) -> bool {
        !self.metainfo_cached.swap(true, Ordering::AcqRel)
    }
}
