use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::constants::{CONN_GRACE_PERIOD, SOCKETS_PER_TORRENT};
use crate::metainfo::Info;
use crate::peer::metadata::{metadata_piece_count, metadata_piece_len};
use crate::peer::{PeerId, PeerPieceState, PeerSession};
use crate::pieces::{Piece, PiecePriority};
use crate::scheduler::{PeerPieces, PeerSnapshot, PieceSnapshot, TorrentSnapshot};
use crate::storage::Storage;
use crate::tracker::TrackerClient;

/// Where an address came from; duplicates keep their first source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    User,
}

/// An address we know about but have not connected to.
#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
}

/// One live connection as the torrent tracks it.
pub struct ConnHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub session: Arc<Mutex<PeerSession>>,
    /// Payload bytes received, for the scheduler's rate ordering.
    pub bytes_downloaded: u64,
    /// Tells the connection's read loop to wind down (eviction,
    /// pruning, torrent close).
    pub shutdown: Arc<tokio::sync::Notify>,
}

impl ConnHandle {
    fn download_rate(&self) -> f64 {
        let session = self.session.lock();
        let age = session.completed_handshake.elapsed().as_secs_f64();
        if age <= 0.0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 / age
    }
}

/// Reassembly buffer for the info dict during magnet acquisition.
#[derive(Debug, Default)]
pub struct MetadataBuf {
    size: Option<usize>,
    pieces: Vec<Option<Bytes>>,
}

impl MetadataBuf {
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Records the size a peer advertised. The first advertisement
    /// wins; it is only ever cleared by [`MetadataBuf::invalidate`].
    pub fn set_size(&mut self, size: usize) {
        if self.size.is_some() || size == 0 {
            return;
        }
        self.size = Some(size);
        self.pieces = vec![None; metadata_piece_count(size)];
    }

    pub fn have_piece(&self, piece: u32) -> bool {
        self.pieces
            .get(piece as usize)
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    pub fn missing_pieces(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Stores one piece. Returns true when that completed the buffer.
    pub fn save_piece(&mut self, piece: u32, data: Bytes) -> bool {
        let Some(size) = self.size else {
            return false;
        };
        let expected = metadata_piece_len(piece, size);
        if expected == 0 || data.len() != expected {
            return false;
        }
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            *slot = Some(data);
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.size.is_some() && self.pieces.iter().all(|p| p.is_some())
    }

    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.size.unwrap_or(0));
        for piece in self.pieces.iter().flatten() {
            out.extend_from_slice(piece);
        }
        Some(Bytes::from(out))
    }

    /// Forgets everything, as after an infohash mismatch. The next
    /// extension handshake starts acquisition over.
    pub fn invalidate(&mut self) {
        self.size = None;
        self.pieces.clear();
    }
}

/// Everything about one torrent that the lock protects.
pub struct TorrentState {
    pub display_name: Option<String>,
    pub info: Option<Info>,
    /// The verified bencoded info dict, served to ut_metadata peers.
    pub raw_info: Option<Bytes>,
    pub storage: Option<Arc<dyn Storage>>,
    pub pieces: Vec<Piece>,
    pub known_peers: HashMap<SocketAddr, KnownPeer>,
    pub conns: Vec<ConnHandle>,
    pub half_open: HashSet<SocketAddr>,
    pub trackers: Vec<Vec<Arc<TrackerClient>>>,
    pub metadata: MetadataBuf,
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub failed_hashes: u64,
}

impl TorrentState {
    pub fn new() -> Self {
        Self {
            display_name: None,
            info: None,
            raw_info: None,
            storage: None,
            pieces: Vec::new(),
            known_peers: HashMap::new(),
            conns: Vec::new(),
            half_open: HashSet::new(),
            trackers: Vec::new(),
            metadata: MetadataBuf::default(),
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            failed_hashes: 0,
        }
    }

    pub fn have_info(&self) -> bool {
        self.info.is_some()
    }

    /// Installs the verified info dict: builds the piece map, attaches
    /// storage, and re-derives per-connection piece knowledge.
    pub fn set_info(&mut self, info: Info, raw_info: Bytes, storage: Arc<dyn Storage>) {
        let mut pieces: Vec<Piece> = info
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, &hash)| Piece::new(hash, info.piece_len(i)))
            .collect();
        for piece in &mut pieces {
            piece.pend_all_chunks();
        }
        self.pieces = pieces;

        let num_pieces = info.num_pieces();
        for conn in &self.conns {
            let mut session = conn.session.lock();
            session.known_pieces = Some(num_pieces);
            match &mut session.peer_pieces {
                PeerPieceState::Have(field) => field.grow(num_pieces),
                PeerPieceState::All | PeerPieceState::Unknown => {}
            }
        }
        self.recount_availability();

        self.display_name = Some(info.name.clone());
        self.info = Some(info);
        self.raw_info = Some(raw_info);
        self.storage = Some(storage);
    }

    pub fn recount_availability(&mut self) {
        for piece in &mut self.pieces {
            piece.availability = 0;
        }
        for conn in &self.conns {
            let session = conn.session.lock();
            for (i, piece) in self.pieces.iter_mut().enumerate() {
                if match &session.peer_pieces {
                    PeerPieceState::All => true,
                    PeerPieceState::Have(field) => field.has(i),
                    PeerPieceState::Unknown => false,
                } {
                    piece.availability += 1;
                }
            }
        }
    }

    pub fn want_piece(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .map(Piece::wanted)
            .unwrap_or(false)
    }

    /// True while connections are worth having: metadata still missing,
    /// or wanted pieces remain.
    pub fn need_data(&self) -> bool {
        if !self.have_info() {
            return true;
        }
        self.pieces.iter().any(Piece::wanted)
    }

    pub fn num_verified(&self) -> usize {
        self.pieces.iter().filter(|p| p.verified).count()
    }

    pub fn have_all_pieces(&self) -> bool {
        self.have_info() && self.num_verified() == self.pieces.len()
    }

    pub fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .map(|p| p.length)
            .sum()
    }

    /// True when any connection or in-flight dial already covers the
    /// address.
    pub fn addr_active(&self, addr: &SocketAddr) -> bool {
        self.half_open.contains(addr) || self.conns.iter().any(|c| c.addr == *addr)
    }

    /// Adds an address to the known set. Duplicates and already-active
    /// addresses are refused.
    pub fn add_known_peer(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        if self.known_peers.contains_key(&addr) || self.addr_active(&addr) {
            return false;
        }
        self.known_peers.insert(addr, KnownPeer { addr, source });
        true
    }

    pub fn pop_peer_to_dial(&mut self) -> Option<KnownPeer> {
        let addr = *self.known_peers.keys().next()?;
        self.known_peers.remove(&addr)
    }

    pub fn conn_index_by_peer_id(&self, peer_id: &PeerId) -> Option<usize> {
        self.conns
            .iter()
            .position(|c| c.session.lock().peer_id == *peer_id)
    }

    pub fn conn_index(&self, id: u64) -> Option<usize> {
        self.conns.iter().position(|c| c.id == id)
    }

    pub fn remove_conn(&mut self, id: u64) -> Option<ConnHandle> {
        let index = self.conn_index(id)?;
        let conn = self.conns.swap_remove(index);
        // Its advertised pieces no longer count toward availability.
        let session = conn.session.lock();
        match &session.peer_pieces {
            PeerPieceState::All => {
                for piece in &mut self.pieces {
                    piece.availability -= 1;
                }
            }
            PeerPieceState::Have(field) => {
                for i in field.set_indices() {
                    if let Some(piece) = self.pieces.get_mut(i) {
                        piece.availability -= 1;
                    }
                }
            }
            PeerPieceState::Unknown => {}
        }
        drop(session);
        Some(conn)
    }

    pub fn bump_availability(&mut self, indices: &[u32]) {
        for &i in indices {
            if let Some(piece) = self.pieces.get_mut(i as usize) {
                piece.availability += 1;
            }
        }
    }

    pub fn bump_availability_all(&mut self) {
        for piece in &mut self.pieces {
            piece.availability += 1;
        }
    }

    /// The connection most worth dropping when over the socket budget.
    /// Freshly handshaken connections get a grace period; after that,
    /// uselessness (no ut_metadata while we need metadata, or no
    /// wanted pieces) and staleness rank a connection worse.
    pub fn worst_conn_index(&self) -> Option<usize> {
        let now = Instant::now();
        self.conns
            .iter()
            .enumerate()
            .map(|(i, conn)| {
                let session = conn.session.lock();
                let in_grace = now.duration_since(session.completed_handshake)
                    < CONN_GRACE_PERIOD / 2;
                let useless = if in_grace {
                    false
                } else if !self.have_info() {
                    session.peer_ut_metadata_id().is_none()
                } else {
                    !self
                        .pieces
                        .iter()
                        .enumerate()
                        .any(|(pi, piece)| piece.wanted() && session.peer_has_piece(pi))
                };
                let idle = session
                    .last_useful_chunk_received
                    .map(|at| now.duration_since(at))
                    .unwrap_or_else(|| now.duration_since(session.completed_handshake));
                let age = now.duration_since(session.completed_handshake);
                (i, (useless, idle, age))
            })
            .max_by_key(|(_, key)| *key)
            .map(|(i, _)| i)
    }

    /// Connections eligible for the periodic prune: idle past the
    /// grace period, oldest idle first, at most enough to get back
    /// under half the socket budget.
    pub fn prune_candidates(&self) -> Vec<u64> {
        let mut license = self
            .conns
            .len()
            .saturating_sub((SOCKETS_PER_TORRENT + 1) / 2);
        let now = Instant::now();
        let mut out = Vec::new();
        for conn in &self.conns {
            if license == 0 {
                break;
            }
            let session = conn.session.lock();
            let last_useful = session
                .last_useful_chunk_received
                .unwrap_or(session.completed_handshake);
            if now.duration_since(last_useful) < CONN_GRACE_PERIOD {
                continue;
            }
            if now.duration_since(session.completed_handshake) < CONN_GRACE_PERIOD {
                continue;
            }
            out.push(conn.id);
            license -= 1;
        }
        out
    }

    /// Merges announce tiers, deduplicating by URL within each tier,
    /// then shuffles every tier per BEP-12.
    pub fn add_trackers(&mut self, tiers: &[Vec<String>]) {
        for (tier_index, urls) in tiers.iter().enumerate() {
            if self.trackers.len() <= tier_index {
                self.trackers.push(Vec::new());
            }
            let tier = &mut self.trackers[tier_index];
            for url in urls {
                if tier.iter().any(|t| t.url() == url) {
                    continue;
                }
                match TrackerClient::new(url) {
                    Ok(client) => tier.push(Arc::new(client)),
                    Err(err) => {
                        tracing::warn!(%url, %err, "skipping unusable tracker");
                    }
                }
            }
            tier.shuffle(&mut rand::rng());
        }
    }

    /// Floats a tracker that answered to the front of its tier.
    pub fn promote_tracker(&mut self, tier_index: usize, url: &str) {
        if let Some(tier) = self.trackers.get_mut(tier_index) {
            if let Some(pos) = tier.iter().position(|t| t.url() == url) {
                tier.swap(0, pos);
            }
        }
    }

    /// Snapshot for one scheduler pass.
    pub fn scheduler_snapshot(
        &self,
        stable_id: usize,
        max_unverified_bytes: u64,
    ) -> TorrentSnapshot {
        let pieces = self
            .pieces
            .iter()
            .map(|piece| PieceSnapshot {
                request: piece.wanted() && !piece.hashing && !piece.queued_for_hash,
                priority: piece.priority,
                partial: piece.is_partial(),
                availability: piece.availability,
                length: piece.length,
                pending_chunks: piece.pending_chunk_specs(),
            })
            .collect();

        let peers = self
            .conns
            .iter()
            .map(|conn| {
                let rate = conn.download_rate();
                let session = conn.session.lock();
                PeerSnapshot {
                    key: conn.id,
                    pieces: match &session.peer_pieces {
                        PeerPieceState::All => PeerPieces::All,
                        PeerPieceState::Have(field) => {
                            PeerPieces::Some((0..field.len()).map(|i| field.has(i)).collect())
                        }
                        PeerPieceState::Unknown => PeerPieces::Some(Vec::new()),
                    },
                    max_requests: session.request_ceiling(),
                    download_rate: rate,
                    age: session.completed_handshake.elapsed(),
                    choking: session.peer_choking,
                    existing_requests: session.requests.clone(),
                    allowed_fast: session.allowed_fast.clone(),
                }
            })
            .collect();

        TorrentSnapshot {
            stable_id,
            max_unverified_bytes,
            capacity: self.storage.as_ref().and_then(|s| s.capacity()),
            pieces,
            peers,
        }
    }

    /// Raises piece priorities for everything, the "download it all"
    /// default.
    pub fn prioritize_all(&mut self) {
        let last = self.pieces.len().saturating_sub(1);
        for piece in &mut self.pieces {
            piece.raise_priority(PiecePriority::Normal);
        }
        // First and last pieces early: they unblock previews and file
        // tail checks.
        if let Some(piece) = self.pieces.first_mut() {
            piece.raise_priority(PiecePriority::Readahead);
        }
        if let Some(piece) = self.pieces.get_mut(last) {
            piece.raise_priority(PiecePriority::Readahead);
        }
    }
}
