//! The client controller: listeners, the torrent registry, dialing and
//! handshake admission, announce driving, and the global policies
//! (blocklist, self-dial detection, banned infohashes).
//!
//! One `Client` owns every torrent. Peer sessions, announce loops, and
//! the pruner all run as tasks that take the relevant torrent's lock
//! for short synchronous sections and never hold it across I/O.

mod dial;


use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use crate::blocklist::Blocklist;
use crate::config::ClientConfig;
use crate::constants::{
    BT_HANDSHAKE_TIMEOUT, CLIENT_NAME, DEFAULT_LISTEN_ADDR, DEFAULT_READAHEAD,
    HALF_OPEN_LIMIT, HANDSHAKES_TIMEOUT, KEEPALIVE_INTERVAL, NOMINAL_DIAL_TIMEOUT,
    OUR_REQQ_NO_UPLOAD, OUR_REQQ_UPLOADING, PEERS_HIGH_WATER, PEERS_LOW_WATER,
    PRUNE_INTERVAL, READ_IDLE_TIMEOUT, SOCKETS_PER_TORRENT, TRACKER_RETRY_DELAY,
};
use crate::metainfo::{Info, InfoHash, MagnetLink, Metainfo};
use crate::mse;
use crate::peer::handshake::PROTOCOL;
use crate::peer::metadata::{metadata_piece_len, METADATA_PIECE_SIZE};
use crate::peer::{
    exchange_handshake, BoxedStream, Direction, ExtensionHandshake, Handshake, MessageQueue,
    MetadataMessage, MetadataMessageType, PeerError, PeerId, PeerSession, Rewound, SessionEvent,
    TransportKind,
};
use crate::pieces::{reader_priorities, PiecePriority, Request};
use crate::scheduler::plan_requests;
use crate::storage::StorageFactory;
use crate::torrent::{ConnHandle, TorrentShared, TorrentState};
use crate::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient};
use crate::wire::{Message, MessageCodec, WireError};

use dial::{dial_race, reduced_dial_timeout};

/// Errors surfaced to users of the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The infohash appears in the banned list.
    #[error("banned torrent")]
    BannedTorrent,

    /// The configured name filter rejected the metadata's name.
    #[error("torrent name rejected")]
    NameRejected,

    #[error("client closed")]
    Closed,

    #[error("no such torrent")]
    UnknownTorrent,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// What to add: an infohash at minimum, trackers and full metainfo
/// when known.
#[derive(Debug, Clone)]
pub struct TorrentSpec {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub tracker_tiers: Vec<Vec<String>>,
    pub metainfo: Option<Metainfo>,
}

impl TorrentSpec {
    pub fn from_magnet(uri: &str) -> Result<Self, ClientError> {
        let magnet = MagnetLink::parse(uri)?;
        Ok(Self {
            info_hash: magnet.info_hash,
            display_name: magnet.display_name,
            // Magnet trackers conventionally form one tier each.
            tracker_tiers: magnet.trackers.into_iter().map(|t| vec![t]).collect(),
            metainfo: None,
        })
    }

    pub fn from_metainfo(metainfo: Metainfo) -> Self {
        Self {
            info_hash: metainfo.info_hash,
            display_name: Some(metainfo.info.name.clone()),
            tracker_tiers: metainfo.announce_list.clone(),
            metainfo: Some(metainfo),
        }
    }
}

struct ClientState {
    torrents: HashMap<InfoHash, Arc<TorrentShared>>,
    banned: HashSet<InfoHash>,
    /// Addresses that answered with our own peer id; we dialed
    /// ourselves through some indirection once and never will again.
    doppelganger_addrs: HashSet<SocketAddr>,
    next_stable_id: usize,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    peer_id: PeerId,
    storage_factory: StorageFactory,
    state: RwLock<ClientState>,
    /// Broadcast on any state change that could release a waiter.
    event: Notify,
    blocklist: RwLock<Option<Blocklist>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
    quit_tx: watch::Sender<bool>,
    quit: watch::Receiver<bool>,
}

/// A BitTorrent client: add torrents, read their data, wait for
/// completion.
pub struct Client {
    inner: Arc<ClientInner>,
}

/// A handle to one torrent within a client.
#[derive(Clone)]
pub struct TorrentHandle {
    inner: Arc<ClientInner>,
    shared: Arc<TorrentShared>,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let peer_id = config.peer_id.unwrap_or_else(PeerId::generate);
        let storage_factory = config.storage_factory();
        let (quit_tx, quit) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            peer_id,
            storage_factory,
            state: RwLock::new(ClientState {
                torrents: HashMap::new(),
                banned: HashSet::new(),
                doppelganger_addrs: HashSet::new(),
                next_stable_id: 0,
            }),
            event: Notify::new(),
            blocklist: RwLock::new(None),
            listen_addr: RwLock::new(None),
            next_conn_id: AtomicU64::new(1),
            quit_tx,
            quit,
            config,
        });

        if !inner.config.no_default_blocklist {
            inner.load_default_blocklist();
        }
        inner.load_banned_infohashes();

        if !inner.config.disable_tcp {
            let addr = inner
                .config
                .listen_addr
                .clone()
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
            let listener = TcpListener::bind(&addr).await?;
            *inner.listen_addr.write() = Some(listener.local_addr()?);
            tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        }

        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.read()
    }

    pub fn set_blocklist(&self, blocklist: Option<Blocklist>) {
        *self.inner.blocklist.write() = blocklist;
    }

    /// Adds a torrent. Returns the handle and whether it was new.
    pub fn add_torrent_spec(
        &self,
        spec: TorrentSpec,
    ) -> Result<(TorrentHandle, bool), ClientError> {
        if *self.inner.quit.borrow() {
            return Err(ClientError::Closed);
        }
        let shared = {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.torrents.get(&spec.info_hash) {
                return Ok((
                    TorrentHandle {
                        inner: Arc::clone(&self.inner),
                        shared: Arc::clone(existing),
                    },
                    false,
                ));
            }
            if state.banned.contains(&spec.info_hash) {
                return Err(ClientError::BannedTorrent);
            }
            let stable_id = state.next_stable_id;
            state.next_stable_id += 1;
            let shared = TorrentShared::new(
                spec.info_hash,
                stable_id,
                self.inner.config.max_unverified_bytes,
            );
            state.torrents.insert(spec.info_hash, Arc::clone(&shared));
            shared
        };

        {
            let mut ts = shared.state.write();
            ts.display_name = spec.display_name.clone();
            ts.add_trackers(&spec.tracker_tiers);
        }

        let mut install = None;
        if let Some(metainfo) = spec.metainfo {
            let raw_info = metainfo.raw_info().clone();
            install = Some((metainfo.info, raw_info));
        } else if let Some(cached) = self.inner.load_cached_metainfo(spec.info_hash) {
            shared.state.write().add_trackers(&cached.announce_list);
            install = Some((cached.info.clone(), cached.raw_info().clone()));
        }
        if let Some((info, raw_info)) = install {
            self.inner.install_metadata(&shared, info, raw_info)?;
        }

        // Per-torrent maintenance tasks.
        if !self.inner.config.disable_trackers {
            tokio::spawn(announce_trackers(
                Arc::clone(&self.inner),
                Arc::clone(&shared),
            ));
        }
        if let Some(dht) = self.inner.config.dht.clone() {
            tokio::spawn(announce_dht(
                Arc::clone(&self.inner),
                Arc::clone(&shared),
                dht,
            ));
        }
        tokio::spawn(prune_loop(Arc::clone(&self.inner), Arc::clone(&shared)));

        Ok((
            TorrentHandle {
                inner: Arc::clone(&self.inner),
                shared,
            },
            true,
        ))
    }

    pub fn add_magnet(&self, uri: &str) -> Result<TorrentHandle, ClientError> {
        Ok(self.add_torrent_spec(TorrentSpec::from_magnet(uri)?)?.0)
    }

    pub fn add_metainfo(&self, metainfo: Metainfo) -> Result<TorrentHandle, ClientError> {
        Ok(self
            .add_torrent_spec(TorrentSpec::from_metainfo(metainfo))?
            .0)
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle> {
        let state = self.inner.state.read();
        state.torrents.get(&info_hash).map(|shared| TorrentHandle {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(shared),
        })
    }

    pub fn drop_torrent(&self, info_hash: InfoHash) -> Result<(), ClientError> {
        self.inner.drop_torrent(info_hash)
    }

    /// Blocks until every torrent has verified every piece; false if
    /// the client closed first.
    pub async fn wait_all(&self) -> bool {
        let mut quit = self.inner.quit.clone();
        loop {
            let notified = self.inner.event.notified();
            tokio::pin!(notified);
            {
                let state = self.inner.state.read();
                let all_done = state.torrents.values().all(|shared| {
                    let ts = shared.state.read();
                    ts.have_info() && ts.have_all_pieces()
                });
                if all_done {
                    return true;
                }
            }
            if *quit.borrow() {
                return false;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = quit.changed() => {}
            }
        }
    }

    /// Shuts everything down: listeners stop, sessions drain, loops
    /// exit.
    pub fn close(&self) {
        let _ = self.inner.quit_tx.send(true);
        let torrents: Vec<Arc<TorrentShared>> = {
            let state = self.inner.state.read();
            state.torrents.values().cloned().collect()
        };
        for shared in torrents {
            self.inner.close_torrent(&shared);
        }
        self.inner.event.notify_waiters();
    }
}

impl TorrentHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    pub fn name(&self) -> Option<String> {
        self.shared.state.read().display_name.clone()
    }

    pub fn have_info(&self) -> bool {
        self.shared.has_metainfo()
    }

    pub fn num_pieces(&self) -> usize {
        self.shared.state.read().pieces.len()
    }

    pub fn bytes_left(&self) -> u64 {
        self.shared.state.read().bytes_left()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.read().have_all_pieces()
    }

    /// Marks every piece wanted and kicks the swarm.
    pub fn download_all(&self) {
        {
            let mut ts = self.shared.state.write();
            ts.prioritize_all();
        }
        self.shared.want_peers.notify_waiters();
        self.inner.replan();
        self.inner.open_new_conns(&self.shared);
    }

    /// Feeds addresses into the swarm, subject to the usual filters.
    pub fn add_peers(&self, peers: Vec<SocketAddr>) {
        self.inner
            .add_peers_to_torrent(&self.shared, peers, crate::torrent::PeerSource::User);
    }

    /// Waits until the torrent has its metadata.
    pub async fn wait_metainfo(&self) -> Result<(), ClientError> {
        let mut got = self.shared.got_metainfo.clone();
        let mut closing = self.shared.closing.clone();
        loop {
            if *got.borrow() {
                return Ok(());
            }
            if *closing.borrow() {
                return Err(ClientError::Closed);
            }
            tokio::select! {
                _ = got.changed() => {}
                _ = closing.changed() => {}
            }
        }
    }

    /// Waits until every piece verifies.
    pub async fn wait_complete(&self) -> Result<(), ClientError> {
        loop {
            let notified = self.shared.event.notified();
            tokio::pin!(notified);
            if self.is_complete() {
                return Ok(());
            }
            if self.shared.is_closed() {
                return Err(ClientError::Closed);
            }
            notified.await;
        }
    }

    /// Reads torrent data at `offset`, blocking until the containing
    /// piece verifies. Raises reader priorities for the pieces ahead.
    /// Reads past the end return zero.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ClientError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait_metainfo().await?;
        loop {
            let notified = self.shared.event.notified();
            tokio::pin!(notified);
            if self.shared.is_closed() {
                return Err(ClientError::Closed);
            }
            let ready = {
                let mut ts = self.shared.state.write();
                let Some(info) = ts.info.as_ref() else {
                    return Err(ClientError::Closed);
                };
                if offset >= info.total_length {
                    return Ok(0);
                }
                let piece_length = info.piece_length;
                let num_pieces = info.num_pieces();
                let index = (offset / piece_length) as usize;

                // The read imposes its priority gradient every pass so
                // a dropped piece gets re-raised rather than starving
                // the reader.
                for (i, priority) in
                    reader_priorities(index, num_pieces, DEFAULT_READAHEAD, piece_length)
                {
                    if let Some(piece) = ts.pieces.get_mut(i) {
                        piece.raise_priority(priority);
                    }
                }

                let piece = &ts.pieces[index];
                if piece.verified {
                    let piece_end = index as u64 * piece_length + piece.length;
                    ts.storage.clone().map(|storage| (storage, piece_end))
                } else {
                    None
                }
            };
            match ready {
                Some((storage, piece_end)) => {
                    let want = (buf.len() as u64).min(piece_end - offset) as usize;
                    return Ok(storage.read_at(offset, &mut buf[..want])?);
                }
                None => {
                    self.shared.want_peers.notify_waiters();
                    self.inner.replan();
                    self.inner.open_new_conns(&self.shared);
                    notified.await;
                }
            }
        }
    }

    pub fn close(&self) {
        let _ = self.inner.drop_torrent(self.shared.info_hash);
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        *self.quit.borrow()
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn has_torrent(&self, info_hash: InfoHash) -> bool {
        self.state.read().torrents.contains_key(&info_hash)
    }

    fn torrent_shared(&self, info_hash: InfoHash) -> Option<Arc<TorrentShared>> {
        self.state.read().torrents.get(&info_hash).cloned()
    }

    /// Secret-key candidates for incoming MSE handshakes: every
    /// infohash we serve.
    fn skeys(&self) -> Vec<[u8; 20]> {
        self.state
            .read()
            .torrents
            .keys()
            .map(|ih| *ih.as_bytes())
            .collect()
    }

    fn is_doppelganger(&self, addr: &SocketAddr) -> bool {
        self.state.read().doppelganger_addrs.contains(addr)
    }

    fn addr_block_reason(&self, addr: &SocketAddr) -> Option<String> {
        let blocklist = self.blocklist.read();
        blocklist.as_ref().and_then(|list| {
            list.block_reason(addr.ip()).map(|reason| match reason {
                crate::blocklist::BlockReason::Listed(desc) => desc,
                crate::blocklist::BlockReason::NotIpv4 => "non-IPv4 address".to_string(),
            })
        })
    }

    fn drop_torrent(&self, info_hash: InfoHash) -> Result<(), ClientError> {
        let shared = {
            let mut state = self.state.write();
            state
                .torrents
                .remove(&info_hash)
                .ok_or(ClientError::UnknownTorrent)?
        };
        self.close_torrent(&shared);
        self.event.notify_waiters();
        Ok(())
    }

    fn close_torrent(&self, shared: &Arc<TorrentShared>) {
        shared.close();
        let ts = shared.state.read();
        for conn in &ts.conns {
            conn.shutdown.notify_one();
            conn.session.lock().close_queue();
        }
    }

    fn load_default_blocklist(&self) {
        let path = match std::env::var_os("TORRENT_BLOCKLIST_FILE") {
            Some(p) => PathBuf::from(p),
            None => self.config.config_dir.join("blocklist"),
        };
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return,
        };
        match Blocklist::parse_p2p(std::io::BufReader::new(file)) {
            Ok(list) => {
                tracing::info!(ranges = list.len(), path = %path.display(), "loaded blocklist");
                *self.blocklist.write() = Some(list);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "bad blocklist file");
            }
        }
    }

    fn load_banned_infohashes(&self) {
        let path = self.config.config_dir.join("banned_infohashes");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return;
        };
        let mut banned = HashSet::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match InfoHash::from_hex(line) {
                Ok(ih) => {
                    banned.insert(ih);
                }
                Err(_) => {
                    tracing::warn!(%line, "bad banned infohash line");
                }
            }
        }
        if !banned.is_empty() {
            self.state.write().banned.extend(banned);
        }
    }

    fn cached_metainfo_path(&self, info_hash: InfoHash) -> PathBuf {
        self.config
            .config_dir
            .join("torrents")
            .join(format!("{}.torrent", info_hash.to_hex()))
    }

    /// Loads a cached metainfo file, checking it still matches its
    /// infohash.
    fn load_cached_metainfo(&self, info_hash: InfoHash) -> Option<Metainfo> {
        if self.config.disable_metainfo_cache {
            return None;
        }
        let data = std::fs::read(self.cached_metainfo_path(info_hash)).ok()?;
        let metainfo = Metainfo::from_bytes(&data).ok()?;
        if metainfo.info_hash != info_hash {
            tracing::warn!(%info_hash, "cached metainfo has wrong infohash");
            return None;
        }
        Some(metainfo)
    }

    fn save_metainfo_cache(&self, shared: &Arc<TorrentShared>, metainfo_bytes: &[u8]) {
        let path = self.cached_metainfo_path(shared.info_hash);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&path, metainfo_bytes) {
            tracing::warn!(path = %path.display(), %err, "failed caching metainfo");
        }
    }

    /// Installs verified metadata: builds pieces, opens storage, wakes
    /// waiters, and queues the initial hash of any existing data.
    fn install_metadata(
        self: &Arc<Self>,
        shared: &Arc<TorrentShared>,
        info: Info,
        raw_info: Bytes,
    ) -> Result<(), ClientError> {
        if let Some(filter) = &self.config.name_filter {
            if filter(&info.name) {
                let _ = self.drop_torrent(shared.info_hash);
                return Err(ClientError::NameRejected);
            }
        }
        let storage = (self.storage_factory)(&info)?;
        let num_pieces = info.num_pieces();
        {
            let mut ts = shared.state.write();
            ts.set_info(info, raw_info.clone(), storage);
        }
        shared.announce_metainfo();

        if !self.config.disable_metainfo_cache && shared.mark_metainfo_cached() {
            let bytes = {
                let ts = shared.state.read();
                cache_bytes(&ts, &raw_info)
            };
            self.save_metainfo_cache(shared, &bytes);
        }

        // Hash whatever data already exists so resumed downloads skip
        // finished pieces. Sequential to keep disk churn bounded.
        let inner = Arc::clone(self);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            for index in 0..num_pieces {
                if shared.is_closed() {
                    return;
                }
                inner.verify_piece(&shared, index as u32).await;
            }
        });

        self.event.notify_waiters();
        Ok(())
    }

    /// One scheduler pass over every torrent, applied to every live
    /// session.
    pub(crate) fn replan(&self) {
        let torrents: Vec<Arc<TorrentShared>> = {
            let state = self.state.read();
            state.torrents.values().cloned().collect()
        };
        let snapshots: Vec<_> = torrents
            .iter()
            .map(|shared| {
                let ts = shared.state.read();
                ts.scheduler_snapshot(shared.stable_id, shared.max_unverified_bytes)
            })
            .collect();
        let plan = plan_requests(&snapshots);
        for shared in &torrents {
            let ts = shared.state.read();
            for conn in &ts.conns {
                if let Some(next) = plan.get(&conn.id) {
                    conn.session.lock().apply_request_state(next);
                }
            }
        }
    }

    /// Feeds addresses into a torrent's known-peer set, applying the
    /// doppelganger and blocklist filters, then dials as budget
    /// allows.
    fn add_peers_to_torrent(
        self: &Arc<Self>,
        shared: &Arc<TorrentShared>,
        peers: Vec<SocketAddr>,
        source: crate::torrent::PeerSource,
    ) {
        let mut added = false;
        {
            let mut ts = shared.state.write();
            for addr in peers {
                if self.is_doppelganger(&addr) {
                    continue;
                }
                if let Some(reason) = self.addr_block_reason(&addr) {
                    tracing::debug!(%addr, %reason, "peer blocked");
                    continue;
                }
                added |= ts.add_known_peer(addr, source);
            }
        }
        if added {
            self.open_new_conns(shared);
        }
    }

    /// Dials known peers while the socket and half-open budgets allow.
    pub(crate) fn open_new_conns(self: &Arc<Self>, shared: &Arc<TorrentShared>) {
        if shared.is_ceasing_networking() || shared.is_closed() || self.is_closed() {
            return;
        }
        loop {
            let dialed = {
                let mut ts = shared.state.write();
                if self.config.no_upload && !ts.need_data() {
                    break;
                }
                if ts.conns.len() >= SOCKETS_PER_TORRENT {
                    break;
                }
                if ts.half_open.len() >= HALF_OPEN_LIMIT {
                    break;
                }
                let Some(peer) = ts.pop_peer_to_dial() else {
                    break;
                };
                ts.half_open.insert(peer.addr);
                let dial_timeout = reduced_dial_timeout(
                    NOMINAL_DIAL_TIMEOUT,
                    HALF_OPEN_LIMIT,
                    ts.known_peers.len(),
                );
                (peer.addr, dial_timeout)
            };
            let (addr, dial_timeout) = dialed;
            tokio::spawn(outgoing_connection(
                Arc::clone(self),
                Arc::clone(shared),
                addr,
                dial_timeout,
            ));
        }
        shared.want_peers.notify_waiters();
    }

    /// Serializes hashing per piece and flips it to verified (or back
    /// to pending) when done.
    async fn verify_piece(self: &Arc<Self>, shared: &Arc<TorrentShared>, index: u32) {
        // Wait our turn: one hash of a given piece at a time.
        let (storage, offset, length, expected) = loop {
            let notified = shared.event.notified();
            tokio::pin!(notified);
            {
                let mut ts = shared.state.write();
                let Some(info) = ts.info.as_ref() else {
                    return;
                };
                let piece_length = info.piece_length;
                let Some(piece) = ts.pieces.get_mut(index as usize) else {
                    return;
                };
                if piece.verified || shared.is_closed() {
                    piece.queued_for_hash = false;
                    return;
                }
                if !piece.hashing {
                    piece.queued_for_hash = false;
                    piece.hashing = true;
                    let Some(storage) = ts.storage.clone() else {
                        return;
                    };
                    let piece = &ts.pieces[index as usize];
                    break (
                        storage,
                        index as u64 * piece_length,
                        piece.length,
                        piece.hash,
                    );
                }
            }
            notified.await;
        };

        // Hash outside the lock.
        let mut data = vec![0u8; length as usize];
        let read = storage.read_at(offset, &mut data);
        let correct = match read {
            Ok(n) if n as u64 == length => {
                let mut hasher = Sha1::new();
                hasher.update(&data);
                let sum: [u8; 20] = hasher.finalize().into();
                sum == expected
            }
            _ => false,
        };
        drop(data);

        // Completion hooks may refuse the piece (commit failure); that
        // reverts it to pending like a bad hash.
        let correct = if correct {
            match storage.completion() {
                Some(completion) => match completion.piece_completed(index) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(piece = index, %err, "piece commit rejected");
                        false
                    }
                },
                None => true,
            }
        } else {
            false
        };

        self.piece_hashed(shared, index, correct);
    }

    fn piece_hashed(self: &Arc<Self>, shared: &Arc<TorrentShared>, index: u32, correct: bool) {
        let all_done = {
            let mut ts = shared.state.write();
            let Some(piece) = ts.pieces.get_mut(index as usize) else {
                return;
            };
            piece.hashing = false;
            let failed_again = piece.ever_hashed && !correct;
            piece.ever_hashed = true;
            if correct {
                piece.verified = true;
                piece.priority = PiecePriority::None;
                piece.pending_chunks.clear();
            } else {
                piece.verified = false;
                piece.pend_all_chunks();
            }
            if failed_again {
                ts.failed_hashes += 1;
                tracing::warn!(piece = index, "piece failed hash");
            }
            if correct {
                for conn in &ts.conns {
                    conn.session.lock().post(Message::Have { index });
                }
            }
            ts.have_all_pieces()
        };

        if all_done && self.config.no_upload {
            shared.cease_networking();
        }
        shared.event.notify_waiters();
        self.event.notify_waiters();
        self.replan();
    }

    /// Handles one received chunk: bookkeeping, the storage write,
    /// cross-connection cancels, and hash queueing.
    fn chunk_received(
        self: &Arc<Self>,
        shared: &Arc<TorrentShared>,
        conn_id: u64,
        index: u32,
        begin: u32,
        data: &Bytes,
    ) -> Option<u32> {
        let mut hash_ready = None;
        {
            let mut ts = shared.state.write();
            if let Some(ci) = ts.conn_index(conn_id) {
                ts.conns[ci].bytes_downloaded += data.len() as u64;
            }

            let Some(piece) = ts.pieces.get(index as usize) else {
                return None;
            };
            let wanted = piece.priority != PiecePriority::None
                && piece.pending_chunks.contains(&begin)
                && piece.chunk_len(begin) as usize == data.len();
            if !wanted {
                if let Some(ci) = ts.conn_index(conn_id) {
                    ts.conns[ci].session.lock().unwanted_chunks_received += 1;
                }
                return None;
            }

            let Some(storage) = ts.storage.clone() else {
                return None;
            };
            if let Err(err) = storage.write_chunk(index, begin, data) {
                // The chunk stays pending and will be fetched again.
                tracing::warn!(piece = index, begin, %err, "chunk write failed");
                return None;
            }

            if let Some(ci) = ts.conn_index(conn_id) {
                let conn = &ts.conns[ci];
                let mut session = conn.session.lock();
                session.useful_chunks_received += 1;
                session.last_useful_chunk_received = Some(std::time::Instant::now());
            }
            ts.downloaded_bytes += data.len() as u64;

            let piece = &mut ts.pieces[index as usize];
            piece.pending_chunks.remove(&begin);
            let request = Request::new(index, begin, data.len() as u32);
            if piece.pending_chunks.is_empty() && !piece.queued_for_hash && !piece.hashing {
                ts.pieces[index as usize].queued_for_hash = true;
                hash_ready = Some(index);
            }

            // Anyone else carrying this chunk gets a cancel.
            for conn in &ts.conns {
                if conn.id == conn_id {
                    continue;
                }
                let mut session = conn.session.lock();
                if session.requests.remove(&request) {
                    session.post(Message::Cancel {
                        index: request.index,
                        begin: request.chunk.begin,
                        length: request.chunk.length,
                    });
                }
            }
        }
        hash_ready
    }
}

/// The `announce-list`-plus-`info` bytes written to the metainfo
/// cache.
fn cache_bytes(ts: &TorrentState, raw_info: &Bytes) -> Vec<u8> {
    use crate::bencode::{from_bytes, to_bytes, Value};
    use std::collections::BTreeMap;

    let mut dict = BTreeMap::new();
    let tiers: Vec<Value> = ts
        .trackers
        .iter()
        .map(|tier| {
            Value::List(
                tier.iter()
                    .map(|client| Value::text(client.url()))
                    .collect(),
            )
        })
        .collect();
    if let Some(first) = ts
        .trackers
        .first()
        .and_then(|tier| tier.first())
        .map(|c| c.url().to_string())
    {
        dict.insert(Bytes::from_static(b"announce"), Value::text(&first));
    }
    if !tiers.is_empty() {
        dict.insert(Bytes::from_static(b"announce-list"), Value::List(tiers));
    }
    if let Ok(info) = from_bytes(raw_info) {
        dict.insert(Bytes::from_static(b"info"), info);
    }
    to_bytes(&Value::Dict(dict))
}

// ----------------------------------------------------------------------------
// Connection setup and the session loop
// ----------------------------------------------------------------------------

async fn accept_loop(inner: Arc<ClientInner>, listener: TcpListener) {
    let mut quit = inner.quit.clone();
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        return;
                    }
                };
                // Cheap rejections before any handshake work.
                if inner.is_doppelganger(&addr) {
                    continue;
                }
                if let Some(reason) = inner.addr_block_reason(&addr) {
                    tracing::debug!(%addr, %reason, "inbound connection blocked");
                    continue;
                }
                tokio::spawn(incoming_connection(Arc::clone(&inner), stream, addr));
            }
        }
    }
}

async fn incoming_connection(
    inner: Arc<ClientInner>,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let stream: BoxedStream = Box::new(stream);
    let accepted = timeout(
        HANDSHAKES_TIMEOUT,
        receive_handshakes(&inner, stream, addr),
    )
    .await;
    match accepted {
        Ok(Ok(Some((shared, stream, theirs, encrypted)))) => {
            run_connection(
                inner,
                shared,
                stream,
                theirs,
                addr,
                TransportKind::Tcp,
                Direction::Incoming,
                encrypted,
            )
            .await;
        }
        Ok(Ok(None)) => {}
        Ok(Err(err)) => {
            tracing::debug!(%addr, %err, "inbound handshake failed");
        }
        Err(_) => {
            tracing::debug!(%addr, "inbound handshake timed out");
        }
    }
}

/// Sniffs plaintext versus MSE on an accepted stream, then runs the BT
/// handshake. `None` means the connection was legitimate but not for
/// us (no matching torrent, self-dial, MSE for an unknown infohash).
async fn receive_handshakes(
    inner: &Arc<ClientInner>,
    mut stream: BoxedStream,
    addr: SocketAddr,
) -> Result<Option<(Arc<TorrentShared>, BoxedStream, Handshake, bool)>, PeerError> {
    let handshakes = async {
        let mut head = [0u8; 20];
        stream.read_exact(&mut head).await?;

        let (mut stream, encrypted): (BoxedStream, bool) =
            if head[0] as usize == PROTOCOL.len() && &head[1..] == PROTOCOL {
                (Box::new(Rewound::new(&head, stream)), false)
            } else {
                let skeys = inner.skeys();
                match mse::receive_handshake(stream, &head, &skeys).await {
                    Ok(received) => {
                        let prefixed =
                            Rewound::new(&received.initial_payload, received.stream);
                        (Box::new(prefixed), true)
                    }
                    Err(mse::MseError::NoSecretKeyMatch) => {
                        return Ok::<Option<(BoxedStream, Handshake, bool)>, PeerError>(None)
                    }
                    Err(err) => {
                        tracing::debug!(%addr, %err, "mse receive failed");
                        return Ok(None);
                    }
                }
            };

        let inner2 = Arc::clone(inner);
        let theirs = exchange_handshake(&mut stream, None, inner.peer_id, move |hs| {
            inner2.has_torrent(hs.info_hash)
        })
        .await?;
        Ok(Some((stream, theirs, encrypted)))
    };

    let Some((stream, theirs, encrypted)) =
        timeout(BT_HANDSHAKE_TIMEOUT, handshakes)
            .await
            .map_err(|_| PeerError::Timeout)??
    else {
        return Ok(None);
    };

    // An incoming connection bearing our own id is ourselves through
    // some reflector; just drop it.
    if theirs.peer_id == inner.peer_id {
        return Ok(None);
    }
    let Some(shared) = inner.torrent_shared(theirs.info_hash) else {
        return Ok(None);
    };
    Ok(Some((shared, stream, theirs, encrypted)))
}

async fn outgoing_connection(
    inner: Arc<ClientInner>,
    shared: Arc<TorrentShared>,
    addr: SocketAddr,
    dial_timeout: std::time::Duration,
) {
    let established = timeout(
        HANDSHAKES_TIMEOUT,
        establish_outgoing(&inner, &shared, addr, dial_timeout),
    )
    .await;

    {
        let mut ts = shared.state.write();
        ts.half_open.remove(&addr);
    }
    inner.open_new_conns(&shared);

    match established {
        Ok(Ok(Some((stream, kind, theirs, encrypted)))) => {
            run_connection(
                inner,
                shared,
                stream,
                theirs,
                addr,
                kind,
                Direction::Outgoing,
                encrypted,
            )
            .await;
        }
        Ok(Ok(None)) => {}
        Ok(Err(err)) => {
            tracing::debug!(%addr, %err, "outgoing connection failed");
        }
        Err(_) => {
            tracing::debug!(%addr, "outgoing connection timed out");
        }
    }
}

/// Dials and handshakes, encrypted first with one plaintext retry.
/// `None` means a policy rejection (doppelganger), not a failure.
async fn establish_outgoing(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    addr: SocketAddr,
    dial_timeout: std::time::Duration,
) -> Result<Option<(BoxedStream, TransportKind, Handshake, bool)>, PeerError> {
    let info_hash = shared.info_hash;

    for encrypted in [true, false] {
        let (stream, kind) = dial_race(
            addr,
            !inner.config.disable_tcp,
            inner.config.utp_dialer.clone(),
            dial_timeout,
        )
        .await?;

        let handshake = timeout(BT_HANDSHAKE_TIMEOUT, async {
            let mut stream: BoxedStream = if encrypted {
                Box::new(
                    mse::initiate_handshake(stream, info_hash.as_bytes(), &[])
                        .await
                        .map_err(|err| {
                            PeerError::Extension(format!("mse initiate: {err}"))
                        })?,
                )
            } else {
                stream
            };
            let theirs =
                exchange_handshake(&mut stream, Some(info_hash), inner.peer_id, |_| true)
                    .await?;
            Ok::<_, PeerError>((stream, theirs))
        })
        .await;

        match handshake {
            Ok(Ok((stream, theirs))) => {
                if theirs.peer_id == inner.peer_id {
                    // We dialed ourselves through some indirection;
                    // remember the address.
                    inner.state.write().doppelganger_addrs.insert(addr);
                    return Ok(None);
                }
                return Ok(Some((stream, kind, theirs, encrypted)));
            }
            Ok(Err(err)) if encrypted => {
                tracing::debug!(%addr, %err, "encrypted handshake failed, retrying plaintext");
            }
            Ok(Err(err)) => return Err(err),
            Err(_) if encrypted => {
                tracing::debug!(%addr, "encrypted handshake timed out, retrying plaintext");
            }
            Err(_) => return Err(PeerError::Timeout),
        }
    }
    unreachable!("plaintext attempt either returns or errors")
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    inner: Arc<ClientInner>,
    shared: Arc<TorrentShared>,
    stream: BoxedStream,
    theirs: Handshake,
    addr: SocketAddr,
    kind: TransportKind,
    direction: Direction,
    encrypted: bool,
) {
    let queue = MessageQueue::new();
    let mut session = PeerSession::new(
        addr,
        kind,
        direction,
        encrypted,
        theirs.peer_id,
        theirs.reserved,
        queue.clone(),
    );

    let conn_id = inner.next_conn_id();
    let shutdown = Arc::new(Notify::new());

    // Admission: no duplicate peer ids, and over-budget swarms evict
    // their worst connection to make room.
    {
        let mut ts = shared.state.write();
        if shared.is_closed() || shared.is_ceasing_networking() {
            return;
        }
        if ts.conn_index_by_peer_id(&theirs.peer_id).is_some() {
            tracing::debug!(peer = ?theirs.peer_id, "duplicate connection refused");
            return;
        }
        if let Some(info) = ts.info.as_ref() {
            session.known_pieces = Some(info.num_pieces());
        }
        ts.conns.push(ConnHandle {
            id: conn_id,
            addr,
            session: Arc::new(parking_lot::Mutex::new(session)),
            bytes_downloaded: 0,
            shutdown: Arc::clone(&shutdown),
        });
        if ts.conns.len() > SOCKETS_PER_TORRENT {
            if let Some(worst) = ts.worst_conn_index() {
                let id = ts.conns[worst].id;
                if let Some(evicted) = ts.remove_conn(id) {
                    evicted.shutdown.notify_one();
                    evicted.session.lock().close_queue();
                }
            }
        }
    }
    inner.event.notify_waiters();

    let (read_half, write_half) = tokio::io::split(stream);
    let writer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run_writer(write_half, KEEPALIVE_INTERVAL).await })
    };

    send_initial_messages(&inner, &shared, conn_id);

    let result = read_loop(&inner, &shared, conn_id, read_half, shutdown).await;
    if let Err(err) = result {
        tracing::debug!(%addr, %err, "session ended");
    }

    // Teardown: the conn leaves the torrent, its queue closes, and the
    // swarm replans without it.
    {
        let mut ts = shared.state.write();
        if let Some(conn) = ts.remove_conn(conn_id) {
            conn.session.lock().close_queue();
        }
    }
    queue.close();
    let _ = writer.await;
    shared.event.notify_waiters();
    inner.event.notify_waiters();
    inner.replan();
    inner.open_new_conns(&shared);
}

/// The post-handshake messages, in protocol order: extended handshake,
/// bitfield (or have-none under fast extension), DHT port.
fn send_initial_messages(inner: &Arc<ClientInner>, shared: &Arc<TorrentShared>, conn_id: u64) {
    let ts = shared.state.read();
    let Some(ci) = ts.conn_index(conn_id) else {
        return;
    };
    let conn = &ts.conns[ci];
    let session = conn.session.lock();

    if session.supports_extended() {
        let reqq = if inner.config.no_upload {
            OUR_REQQ_NO_UPLOAD
        } else {
            OUR_REQQ_UPLOADING
        };
        let metadata_size = ts
            .raw_info
            .as_ref()
            .map(|raw| raw.len() as i64)
            .or_else(|| ts.metadata.size().map(|s| s as i64));
        let port = inner.listen_addr.read().map(|a| a.port());
        let your_ip = Some(match conn.addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
            std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
        });
        let hs = ExtensionHandshake::ours(CLIENT_NAME, reqq, metadata_size, port, your_ip);
        session.post_extended(crate::peer::extension::EXTENSION_HANDSHAKE_ID, hs.encode());
    }

    let have_any = ts.pieces.iter().any(|p| p.verified);
    if have_any {
        let mut field = crate::peer::Bitfield::new(ts.pieces.len());
        for (i, piece) in ts.pieces.iter().enumerate() {
            if piece.verified {
                field.set(i);
            }
        }
        session.post(Message::Bitfield(field.to_wire()));
    } else if session.supports_fast() {
        session.post(Message::HaveNone);
    }

    if let Some(dht) = &inner.config.dht {
        if session.peer_reserved.supports_dht() {
            session.post(Message::Port(dht.port()));
        }
    }
}

async fn read_loop(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    conn_id: u64,
    mut read_half: tokio::io::ReadHalf<BoxedStream>,
    shutdown: Arc<Notify>,
) -> Result<(), PeerError> {
    let mut codec = MessageCodec::new();
    let mut closing = shared.closing.clone();
    loop {
        let msg = tokio::select! {
            _ = closing.changed() => return Ok(()),
            _ = shutdown.notified() => return Ok(()),
            read = timeout(READ_IDLE_TIMEOUT, codec.read_message(&mut read_half)) => {
                match read {
                    Err(_) => return Err(PeerError::Timeout),
                    Ok(Err(WireError::Closed)) => return Ok(()),
                    Ok(Err(err)) => return Err(err.into()),
                    Ok(Ok(msg)) => msg,
                }
            }
        };

        let events = {
            let ts = shared.state.read();
            let Some(ci) = ts.conn_index(conn_id) else {
                return Ok(());
            };
            let mut session = ts.conns[ci].session.lock();
            session.handle_message(msg)?
        };

        for event in events {
            handle_session_event(inner, shared, conn_id, event).await?;
        }
    }
}

async fn handle_session_event(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    conn_id: u64,
    event: SessionEvent,
) -> Result<(), PeerError> {
    match event {
        SessionEvent::RequestsCleared(_) | SessionEvent::NeedReplenish => {
            inner.replan();
        }
        SessionEvent::PeerInterestChanged(interested) => {
            // Upload choking is deliberately simple: interested peers
            // get unchoked unless uploading is off.
            let ts = shared.state.read();
            if let Some(ci) = ts.conn_index(conn_id) {
                let mut session = ts.conns[ci].session.lock();
                if interested && !inner.config.no_upload && session.choking {
                    session.choking = false;
                    session.post(Message::Unchoke);
                } else if !interested && !session.choking {
                    session.choking = true;
                    session.post(Message::Choke);
                }
            }
        }
        SessionEvent::PeerGainedPieces(indices) => {
            {
                let mut ts = shared.state.write();
                ts.bump_availability(&indices);
            }
            inner.replan();
        }
        SessionEvent::PeerHasAll => {
            {
                let mut ts = shared.state.write();
                ts.bump_availability_all();
            }
            inner.replan();
        }
        SessionEvent::UploadRequested(request) => {
            serve_chunk(inner, shared, conn_id, request)?;
        }
        SessionEvent::ChunkReceived {
            index,
            begin,
            data,
            was_requested: _,
        } => {
            let hash_ready = inner.chunk_received(shared, conn_id, index, begin, &data);
            if let Some(piece) = hash_ready {
                let inner = Arc::clone(inner);
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    inner.verify_piece(&shared, piece).await;
                });
            }
            inner.replan();
        }
        SessionEvent::ExtendedHandshake(hs) => {
            handle_extended_handshake(shared, conn_id, hs);
        }
        SessionEvent::Metadata(msg) => {
            handle_metadata_message(inner, shared, conn_id, msg);
        }
        SessionEvent::Pex(msg) => {
            let peers: Vec<SocketAddr> = msg.added.into_iter().map(|(addr, _)| addr).collect();
            inner.add_peers_to_torrent(shared, peers, crate::torrent::PeerSource::Pex);
        }
        SessionEvent::DhtPort(port) => {
            if let Some(dht) = &inner.config.dht {
                let addr = {
                    let ts = shared.state.read();
                    ts.conn_index(conn_id).map(|ci| ts.conns[ci].addr)
                };
                if let Some(addr) = addr {
                    let node = SocketAddr::new(addr.ip(), if port == 0 { addr.port() } else { port });
                    dht.ping(node);
                }
            }
        }
    }
    Ok(())
}

/// Serves one upload request synchronously: read from storage, post
/// the piece. Uses the requested piece's own length so the final short
/// piece bounds correctly.
fn serve_chunk(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    conn_id: u64,
    request: Request,
) -> Result<(), PeerError> {
    let ts = shared.state.read();
    let Some(ci) = ts.conn_index(conn_id) else {
        return Ok(());
    };
    let conn = &ts.conns[ci];

    if inner.config.no_upload {
        // Refusing to upload is silent; the request just never
        // completes.
        conn.session.lock().peer_requests.remove(&request);
        return Ok(());
    }

    let Some(info) = ts.info.as_ref() else {
        return Ok(());
    };
    let Some(piece) = ts.pieces.get(request.index as usize) else {
        return Err(PeerError::Protocol("request outside piece space"));
    };
    let end = request.chunk.begin as u64 + request.chunk.length as u64;
    if end > piece.length {
        return Err(PeerError::Protocol("request past piece end"));
    }
    if !piece.verified {
        let mut session = conn.session.lock();
        session.peer_requests.remove(&request);
        if session.supports_fast() {
            session.post(Message::RejectRequest {
                index: request.index,
                begin: request.chunk.begin,
                length: request.chunk.length,
            });
        }
        return Ok(());
    }

    let Some(storage) = ts.storage.clone() else {
        return Ok(());
    };
    let offset = request.index as u64 * info.piece_length + request.chunk.begin as u64;
    drop(ts);

    let mut data = vec![0u8; request.chunk.length as usize];
    let read = storage
        .read_at(offset, &mut data)
        .map_err(|e| PeerError::Extension(format!("upload read: {e}")))?;
    if read != data.len() {
        return Err(PeerError::Protocol("short read serving request"));
    }

    let ts = shared.state.read();
    if let Some(ci) = ts.conn_index(conn_id) {
        let mut session = ts.conns[ci].session.lock();
        session.peer_requests.remove(&request);
        session.post(Message::Piece {
            index: request.index,
            begin: request.chunk.begin,
            data: Bytes::from(data),
        });
    }
    drop(ts);
    shared.state.write().uploaded_bytes += request.chunk.length as u64;
    Ok(())
}

fn handle_extended_handshake(
    shared: &Arc<TorrentShared>,
    conn_id: u64,
    hs: ExtensionHandshake,
) {
    let mut ts = shared.state.write();
    if let Some(size) = hs.metadata_size {
        if size > 0 && !ts.have_info() {
            ts.metadata.set_size(size as usize);
        }
    }
    if ts.have_info() {
        return;
    }
    let Some(ci) = ts.conn_index(conn_id) else {
        return;
    };
    let session = ts.conns[ci].session.lock();
    // A peer that can serve metadata gets asked for every missing
    // piece immediately, in random order.
    if let Some(peer_ext_id) = session.peer_ut_metadata_id() {
        let mut missing = ts.metadata.missing_pieces();
        missing.shuffle(&mut rand::rng());
        for piece in missing {
            session.post_extended(peer_ext_id, MetadataMessage::request(piece).encode());
        }
    }
}

fn handle_metadata_message(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    conn_id: u64,
    msg: MetadataMessage,
) {
    match msg.msg_type {
        MetadataMessageType::Data => {
            let completed = {
                let mut ts = shared.state.write();
                if ts.have_info() {
                    false
                } else {
                    if let Some(total) = msg.total_size {
                        if total > 0 {
                            ts.metadata.set_size(total as usize);
                        }
                    }
                    let data = msg.data.unwrap_or_default();
                    let done = ts.metadata.save_piece(msg.piece, data);
                    if let Some(ci) = ts.conn_index(conn_id) {
                        let mut session = ts.conns[ci].session.lock();
                        session.useful_chunks_received += 1;
                        session.last_useful_chunk_received = Some(std::time::Instant::now());
                    }
                    done
                }
            };
            if completed {
                finish_metadata(inner, shared);
            }
        }
        MetadataMessageType::Request => {
            let reply = {
                let ts = shared.state.read();
                match ts.raw_info.as_ref() {
                    Some(raw) => {
                        let len = metadata_piece_len(msg.piece, raw.len());
                        if len == 0 {
                            MetadataMessage::reject(msg.piece)
                        } else {
                            let start = msg.piece as usize * METADATA_PIECE_SIZE;
                            MetadataMessage::data(
                                msg.piece,
                                raw.len() as i64,
                                raw.slice(start..start + len),
                            )
                        }
                    }
                    None => MetadataMessage::reject(msg.piece),
                }
            };
            let ts = shared.state.read();
            if let Some(ci) = ts.conn_index(conn_id) {
                let session = ts.conns[ci].session.lock();
                if let Some(peer_ext_id) = session.peer_ut_metadata_id() {
                    session.post_extended(peer_ext_id, reply.encode());
                }
            }
        }
        MetadataMessageType::Reject => {}
    }
}

/// The whole reassembled buffer either hashes to the infohash or gets
/// thrown away and acquisition starts over.
fn finish_metadata(inner: &Arc<ClientInner>, shared: &Arc<TorrentShared>) {
    let assembled = {
        let ts = shared.state.read();
        ts.metadata.assemble()
    };
    let Some(raw) = assembled else {
        return;
    };

    let mut hasher = Sha1::new();
    hasher.update(&raw);
    let sum: [u8; 20] = hasher.finalize().into();
    if sum != *shared.info_hash.as_bytes() {
        tracing::warn!(info_hash = %shared.info_hash, "metadata failed infohash check");
        shared.state.write().metadata.invalidate();
        return;
    }

    let info = match Info::from_dict_bytes(&raw) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(%err, "metadata did not parse");
            shared.state.write().metadata.invalidate();
            return;
        }
    };

    if let Err(err) = inner.install_metadata(shared, info, raw) {
        tracing::warn!(%err, "metadata install failed");
        return;
    }
    tracing::info!(info_hash = %shared.info_hash, "got metadata from peers");
    inner.replan();
}

// ----------------------------------------------------------------------------
// Discovery loops
// ----------------------------------------------------------------------------

/// True when the torrent wants peers (below the low-water mark and
/// still needs data); false once networking is done.
async fn wait_want_peers(shared: &Arc<TorrentShared>) -> bool {
    let mut ceasing = shared.ceasing_networking.clone();
    loop {
        let notified = shared.want_peers.notified();
        tokio::pin!(notified);
        if shared.is_ceasing_networking() || shared.is_closed() {
            return false;
        }
        {
            let ts = shared.state.read();
            if ts.known_peers.len() < PEERS_LOW_WATER && ts.need_data() {
                return true;
            }
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = ceasing.changed() => {}
        }
    }
}

fn base_announce_request(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    event: AnnounceEvent,
) -> AnnounceRequest {
    let (left, downloaded, uploaded) = {
        let ts = shared.state.read();
        (ts.bytes_left(), ts.downloaded_bytes, ts.uploaded_bytes)
    };
    AnnounceRequest {
        info_hash: shared.info_hash,
        peer_id: *inner.peer_id.as_bytes(),
        port: inner.listen_addr.read().map(|a| a.port()).unwrap_or(0),
        uploaded,
        downloaded,
        left,
        event,
        num_want: None,
    }
}

/// One tracker announce with the blocklist check in front. Returns the
/// interval the tracker asked for.
async fn announce_single(
    inner: &Arc<ClientInner>,
    shared: &Arc<TorrentShared>,
    client: &TrackerClient,
    request: &AnnounceRequest,
) -> Result<u32, crate::tracker::TrackerError> {
    if inner.blocklist.read().is_some() {
        if let Some(host) = client.host() {
            let resolved = tokio::net::lookup_host((host, request.port.max(1)))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>())
                .unwrap_or_default();
            for addr in resolved {
                if inner.addr_block_reason(&addr).is_some() {
                    return Err(crate::tracker::TrackerError::Failure(
                        "tracker address blocked".into(),
                    ));
                }
            }
        }
    }

    let response = client.announce(request).await?;
    inner.add_peers_to_torrent(
        shared,
        response.peers.clone(),
        crate::torrent::PeerSource::Tracker,
    );
    tracing::debug!(
        tracker = client.url(),
        peers = response.peers.len(),
        "announce succeeded"
    );
    Ok(response.interval)
}

async fn announce_trackers(inner: Arc<ClientInner>, shared: Arc<TorrentShared>) {
    if !wait_want_peers(&shared).await {
        return;
    }

    // Fast start: every tracker in every tier at once.
    let all: Vec<(usize, Arc<TrackerClient>)> = {
        let ts = shared.state.read();
        ts.trackers
            .iter()
            .enumerate()
            .flat_map(|(tier, clients)| {
                clients.iter().cloned().map(move |c| (tier, c))
            })
            .collect()
    };
    let mut event = AnnounceEvent::Started;
    let request = base_announce_request(&inner, &shared, event);
    let mut fast_start = Vec::new();
    for (_, client) in &all {
        let inner = Arc::clone(&inner);
        let shared = Arc::clone(&shared);
        let client = Arc::clone(client);
        let request = request.clone();
        fast_start.push(tokio::spawn(async move {
            announce_single(&inner, &shared, &client, &request).await.is_ok()
        }));
    }
    let mut any_ok = false;
    for task in fast_start {
        any_ok |= task.await.unwrap_or(false);
    }
    if any_ok {
        event = AnnounceEvent::None;
    }

    // Steady state: walk the tiers in order, float successes to the
    // front, sleep the returned interval.
    'announce: while wait_want_peers(&shared).await {
        let request = base_announce_request(&inner, &shared, event);
        let tiers: Vec<Vec<Arc<TrackerClient>>> = {
            let ts = shared.state.read();
            ts.trackers.clone()
        };
        let mut tried = 0usize;
        for (tier_index, tier) in tiers.iter().enumerate() {
            for client in tier {
                tried += 1;
                match announce_single(&inner, &shared, client, &request).await {
                    Ok(interval) => {
                        {
                            let mut ts = shared.state.write();
                            ts.promote_tracker(tier_index, client.url());
                        }
                        event = AnnounceEvent::None;
                        let mut closing = shared.closing.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_secs(interval as u64)) => {}
                            _ = closing.changed() => return,
                        }
                        continue 'announce;
                    }
                    Err(err) => {
                        tracing::debug!(tracker = client.url(), %err, "announce failed");
                    }
                }
            }
        }
        if tried != 0 {
            tracing::warn!(info_hash = %shared.info_hash, "all trackers failed");
        }
        let mut closing = shared.closing.clone();
        tokio::select! {
            _ = tokio::time::sleep(TRACKER_RETRY_DELAY) => {}
            _ = closing.changed() => return,
        }
    }
}

async fn announce_dht(
    inner: Arc<ClientInner>,
    shared: Arc<TorrentShared>,
    dht: Arc<dyn crate::dht::Dht>,
) {
    while wait_want_peers(&shared).await {
        let port = inner.listen_addr.read().map(|a| a.port()).unwrap_or(0);
        let mut batches = dht.announce(shared.info_hash, port);
        let mut ceasing = shared.ceasing_networking.clone();
        loop {
            tokio::select! {
                batch = batches.recv() => {
                    let Some(peers) = batch else { break };
                    inner.add_peers_to_torrent(&shared, peers, crate::torrent::PeerSource::Dht);
                    let known = shared.state.read().known_peers.len();
                    if known >= PEERS_HIGH_WATER {
                        break;
                    }
                }
                _ = ceasing.changed() => return,
            }
        }
    }
}

/// Periodically sheds idle connections so there is room to dial
/// replacements.
async fn prune_loop(inner: Arc<ClientInner>, shared: Arc<TorrentShared>) {
    let mut closing = shared.closing.clone();
    loop {
        tokio::select! {
            _ = closing.changed() => return,
            _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
        }
        if shared.is_ceasing_networking() {
            return;
        }
        let victims = {
            let ts = shared.state.read();
            ts.prune_candidates()
        };
        if victims.is_empty() {
            continue;
        }
        {
            let mut ts = shared.state.write();
            for id in victims {
                if let Some(conn) = ts.remove_conn(id) {
                    conn.shutdown.notify_one();
                    conn.session.lock().close_queue();
                }
            }
        }
        inner.open_new_conns(&shared);
    }
}
