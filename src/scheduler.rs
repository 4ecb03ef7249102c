//! Global chunk-request assignment.
//!
//! One planning pass looks at every active torrent and produces, per
//! peer, the set of chunk requests that peer should have outstanding.
//! The pass is pure: it consumes snapshots taken under the client lock
//! and never blocks on I/O. Sessions then diff the plan against their
//! current request sets, posting `Request` for additions and `Cancel`
//! for removals.
//!
//! Ordering is everything here. Pieces are visited by
//! `(priority desc, partial desc, availability asc, index asc,
//! torrent stable id asc)`; within a piece, candidate peers are ranked
//! by `(requests already in this piece asc, requestable pieces left
//! asc, download rate desc, [already holds this chunk], age desc, id
//! asc)`. In-flight requests are honoured first, then remaining chunks
//! are spread, then a strictly better-ranked peer may steal a chunk
//! from its current holder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::pieces::{ChunkSpec, PiecePriority, Request};
use crate::storage::Capacity;

/// Hard per-peer ceiling on outstanding requests per planning pass; the
/// peer's advertised `reqq` lowers it further.
pub const MAX_PLANNED_REQUESTS: usize = 32;

/// Stable identity of a peer across planning passes.
pub type PeerKey = u64;

/// Which pieces a peer advertises.
#[derive(Debug, Clone)]
pub enum PeerPieces {
    /// Fast-extension HaveAll, or a verified seed.
    All,
    /// Indexed by piece; missing tail indices mean "doesn't have".
    Some(Vec<bool>),
}

impl PeerPieces {
    pub fn has(&self, index: usize) -> bool {
        match self {
            PeerPieces::All => true,
            PeerPieces::Some(v) => v.get(index).copied().unwrap_or(false),
        }
    }
}

/// A peer as the scheduler sees it: a point-in-time snapshot.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub key: PeerKey,
    pub pieces: PeerPieces,
    /// Effective request ceiling, already clamped by the session.
    pub max_requests: usize,
    pub download_rate: f64,
    pub age: Duration,
    pub choking: bool,
    /// Requests currently in flight on this peer's wire.
    pub existing_requests: HashSet<Request>,
    /// Pieces the peer granted us while choking (BEP-6 AllowedFast).
    pub allowed_fast: HashSet<u32>,
}

impl PeerSnapshot {
    fn has_piece(&self, index: usize) -> bool {
        self.pieces.has(index)
    }

    fn piece_allowed_fast(&self, index: u32) -> bool {
        self.allowed_fast.contains(&index)
    }

    fn can_request_piece(&self, index: usize) -> bool {
        self.has_piece(index) && (!self.choking || self.piece_allowed_fast(index as u32))
    }
}

/// A piece as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct PieceSnapshot {
    /// Wanted and not yet verified.
    pub request: bool,
    pub priority: PiecePriority,
    pub partial: bool,
    pub availability: i64,
    pub length: u64,
    pub pending_chunks: Vec<ChunkSpec>,
}

/// One torrent's contribution to a planning pass.
pub struct TorrentSnapshot {
    /// Tie-break of last resort between torrents.
    pub stable_id: usize,
    /// Zero disables the unverified-bytes ceiling.
    pub max_unverified_bytes: u64,
    /// Shared storage budget; torrents holding the same handle compete.
    pub capacity: Option<Arc<Capacity>>,
    pub pieces: Vec<PieceSnapshot>,
    pub peers: Vec<PeerSnapshot>,
}

/// What a peer should look like after this pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerRequestState {
    pub interested: bool,
    pub requests: HashSet<Request>,
}

struct PlanPeer<'a> {
    snap: &'a PeerSnapshot,
    next: PeerRequestState,
    requestable_remaining: i64,
}

impl PlanPeer<'_> {
    fn can_fit_request(&self) -> bool {
        self.next.requests.len() < self.snap.max_requests.min(MAX_PLANNED_REQUESTS)
    }
}

/// Plans requests across every torrent. Returns the desired next state
/// for every peer that appeared in any snapshot.
pub fn plan_requests(torrents: &[TorrentSnapshot]) -> HashMap<PeerKey, PeerRequestState> {
    // Remaining storage budget for this pass, shared between torrents
    // that hand us the same capacity handle.
    let mut storage_left: HashMap<usize, i64> = HashMap::new();
    for t in torrents {
        if let Some(cap) = &t.capacity {
            storage_left
                .entry(Arc::as_ptr(cap) as usize)
                .or_insert_with(|| cap.remaining() as i64);
        }
    }

    let mut peers: Vec<Vec<PlanPeer>> = torrents
        .iter()
        .map(|t| {
            t.peers
                .iter()
                .map(|snap| PlanPeer {
                    snap,
                    next: PeerRequestState::default(),
                    requestable_remaining: 0,
                })
                .collect()
        })
        .collect();

    // Flat piece order across all torrents.
    let mut order: Vec<(usize, usize)> = Vec::new();
    for (ti, t) in torrents.iter().enumerate() {
        for (pi, piece) in t.pieces.iter().enumerate() {
            order.push((ti, pi));
            if piece.request && !piece.pending_chunks.is_empty() {
                for peer in &mut peers[ti] {
                    if peer.snap.can_request_piece(pi) {
                        peer.requestable_remaining += 1;
                    }
                }
            }
        }
    }
    order.sort_by(|&(ati, api), &(bti, bpi)| {
        let a = &torrents[ati].pieces[api];
        let b = &torrents[bti].pieces[bpi];
        b.priority
            .cmp(&a.priority)
            .then(b.partial.cmp(&a.partial))
            .then(a.availability.cmp(&b.availability))
            .then(api.cmp(&bpi))
            .then(torrents[ati].stable_id.cmp(&torrents[bti].stable_id))
    });

    let mut unverified: Vec<u64> = vec![0; torrents.len()];
    for (ti, pi) in order {
        let torrent = &torrents[ti];
        let piece = &torrent.pieces[pi];
        // Pieces that contributed to requestable_remaining above; any
        // skip below must release that contribution.
        let counted = piece.request && !piece.pending_chunks.is_empty();

        if let Some(cap) = &torrent.capacity {
            if let Some(left) = storage_left.get_mut(&(Arc::as_ptr(cap) as usize)) {
                // The piece occupies cache space whether or not it is
                // wanted, so the budget is charged either way.
                if *left < piece.length as i64 {
                    if counted {
                        release_requestable(pi, &mut peers[ti]);
                    }
                    continue;
                }
                *left -= piece.length as i64;
            }
        }
        if !counted {
            continue;
        }
        if torrent.max_unverified_bytes != 0
            && unverified[ti] + piece.length > torrent.max_unverified_bytes
        {
            release_requestable(pi, &mut peers[ti]);
            continue;
        }
        allocate_pending_chunks(pi, piece, &mut peers[ti]);
        unverified[ti] += piece.length;
    }

    let mut out = HashMap::new();
    for torrent_peers in peers {
        for peer in torrent_peers {
            debug_assert_eq!(peer.requestable_remaining, 0);
            out.insert(peer.snap.key, peer.next);
        }
    }
    out
}

/// Undoes a piece's contribution to every peer's requestable count.
fn release_requestable(index: usize, peers: &mut [PlanPeer]) {
    for peer in peers.iter_mut() {
        if peer.snap.can_request_piece(index) {
            peer.requestable_remaining -= 1;
        }
    }
}

/// Re-sorts the peer visit order for one placement decision.
fn rank_peers(
    ranked: &mut [usize],
    peers: &[PlanPeer<'_>],
    requests_in_piece: &[usize],
    by_has_request: Option<Request>,
) {
    ranked.sort_by(|&a, &b| {
        let pa = &peers[a];
        let pb = &peers[b];
        requests_in_piece[a]
            .cmp(&requests_in_piece[b])
            .then(pa.requestable_remaining.cmp(&pb.requestable_remaining))
            .then(
                pb.snap
                    .download_rate
                    .partial_cmp(&pa.snap.download_rate)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then_with(|| match by_has_request {
                // All else equal the current holder keeps the chunk, so
                // nothing moves without a strictly better home.
                Some(req) => {
                    let a_has = pa.next.requests.contains(&req);
                    let b_has = pb.next.requests.contains(&req);
                    b_has.cmp(&a_has)
                }
                None => std::cmp::Ordering::Equal,
            })
            .then(pb.snap.age.cmp(&pa.snap.age))
            .then(pa.snap.key.cmp(&pb.snap.key))
    });
}

/// Assigns one piece's pending chunks across its torrent's peers.
fn allocate_pending_chunks(index: usize, piece: &PieceSnapshot, peers: &mut [PlanPeer]) {
    // Per-piece rank state: how many of this piece's chunks each peer
    // has been given so far.
    let mut requests_in_piece = vec![0usize; peers.len()];
    // Peer visit order, re-sorted before every placement decision.
    let mut ranked: Vec<usize> = (0..peers.len()).collect();

    // Phase one: every chunk a peer already has in flight stays with it.
    let mut preallocated: HashMap<ChunkSpec, usize> = HashMap::new();
    for &chunk in &piece.pending_chunks {
        let req = Request {
            index: index as u32,
            chunk,
        };
        for (pi, peer) in peers.iter_mut().enumerate() {
            if !peer.snap.existing_requests.contains(&req) {
                continue;
            }
            if !peer.can_fit_request() {
                continue;
            }
            if !peer.snap.can_request_piece(index) {
                continue;
            }
            preallocated.insert(chunk, pi);
            peer.next.requests.insert(req);
            requests_in_piece[pi] += 1;
        }
    }

    // Phase two: spread the unclaimed chunks.
    let mut chunks_remaining = piece.pending_chunks.len();
    for &chunk in &piece.pending_chunks {
        if preallocated.contains_key(&chunk) {
            continue;
        }
        chunks_remaining -= 1;
        let req = Request {
            index: index as u32,
            chunk,
        };
        rank_peers(&mut ranked, peers, &requests_in_piece, None);
        for &pi in ranked.iter() {
            let peer = &mut peers[pi];
            if !peer.can_fit_request() {
                continue;
            }
            if !peer.snap.has_piece(index) {
                continue;
            }
            if !peer.snap.piece_allowed_fast(index as u32) {
                peer.next.interested = true;
                if peer.snap.choking {
                    continue;
                }
            }
            peer.next.requests.insert(req);
            requests_in_piece[pi] += 1;
            break;
        }
    }

    // Phase three: revisit in-flight chunks; a strictly better-ranked
    // peer takes the chunk from its holder.
    for (&chunk, &holder) in &preallocated {
        let req = Request {
            index: index as u32,
            chunk,
        };
        requests_in_piece[holder] -= 1;
        rank_peers(&mut ranked, peers, &requests_in_piece, Some(req));
        peers[holder].next.requests.remove(&req);
        for &pi in ranked.iter() {
            let peer = &mut peers[pi];
            if !peer.can_fit_request() {
                continue;
            }
            if !peer.snap.has_piece(index) {
                continue;
            }
            if !peer.snap.piece_allowed_fast(index as u32) {
                peer.next.interested = true;
                if peer.snap.choking {
                    continue;
                }
            }
            peer.next.requests.insert(req);
            requests_in_piece[pi] += 1;
            chunks_remaining -= 1;
            break;
        }
    }
    debug_assert_eq!(chunks_remaining, 0);

    release_requestable(index, peers);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(index: u32, begin: u32) -> Request {
        Request::new(index, begin, 1)
    }

    fn chunk_range(n: u32) -> Vec<ChunkSpec> {
        (0..n).map(|b| ChunkSpec { begin: b, length: 1 }).collect()
    }

    fn chunks(begins: &[u32]) -> Vec<ChunkSpec> {
        begins
            .iter()
            .map(|&b| ChunkSpec { begin: b, length: 1 })
            .collect()
    }

    fn base_peer(key: PeerKey) -> PeerSnapshot {
        PeerSnapshot {
            key,
            pieces: PeerPieces::All,
            max_requests: usize::MAX,
            download_rate: 2.0,
            age: Duration::ZERO,
            choking: false,
            existing_requests: HashSet::new(),
            allowed_fast: HashSet::new(),
        }
    }

    fn one_piece_torrent(pending: Vec<ChunkSpec>, peers: Vec<PeerSnapshot>) -> TorrentSnapshot {
        TorrentSnapshot {
            stable_id: 0,
            max_unverified_bytes: 0,
            capacity: None,
            pieces: vec![PieceSnapshot {
                request: true,
                priority: PiecePriority::Normal,
                partial: false,
                availability: 0,
                length: pending.len() as u64,
                pending_chunks: pending,
            }],
            peers,
        }
    }

    fn check(state: &PeerRequestState, len: usize) {
        assert_eq!(state.requests.len(), len, "requests: {:?}", state.requests);
        assert_eq!(state.interested, len > 0);
    }

    #[test]
    fn test_stealing_from_slower_peer() {
        let mut stealee = base_peer(1);
        stealee.download_rate = 1.0;
        stealee.existing_requests = (0..5).map(|b| req(0, b)).collect();
        let first_stealer = base_peer(2);
        let second_stealer = base_peer(3);

        let results = plan_requests(&[one_piece_torrent(
            chunk_range(5),
            vec![stealee, first_stealer, second_stealer],
        )]);

        assert_eq!(results.len(), 3);
        check(&results[&1], 1);
        check(&results[&2], 2);
        check(&results[&3], 2);
    }

    #[test]
    fn test_stealing_from_slower_peer_basic() {
        let mut stealee = base_peer(1);
        stealee.download_rate = 1.0;
        stealee.existing_requests = (0..2).map(|b| req(0, b)).collect();
        let first_stealer = base_peer(2);
        let second_stealer = base_peer(3);

        let results = plan_requests(&[one_piece_torrent(
            chunks(&[0, 1]),
            vec![stealee, first_stealer, second_stealer],
        )]);

        check(&results[&2], 1);
        check(&results[&3], 1);
        assert!(results[&1].requests.is_empty());
        assert!(!results[&1].interested);
    }

    #[test]
    fn test_peer_keeps_existing_if_reasonable() {
        let keep = req(0, 0);
        let mut stealee = base_peer(1);
        stealee.download_rate = 1.0;
        stealee.existing_requests = [keep].into_iter().collect();
        let first_stealer = base_peer(2);
        let second_stealer = base_peer(3);

        let results = plan_requests(&[one_piece_torrent(
            chunks(&[0, 1, 3, 4]),
            vec![stealee, first_stealer, second_stealer],
        )]);

        assert_eq!(results.len(), 3);
        check(&results[&2], 2);
        check(&results[&3], 1);
        assert_eq!(
            results[&1],
            PeerRequestState {
                interested: true,
                requests: [keep].into_iter().collect(),
            }
        );
    }

    #[test]
    fn test_dont_steal_unnecessarily() {
        let keep: HashSet<Request> = [req(0, 0), req(0, 1), req(0, 2)].into_iter().collect();
        let mut stealee = base_peer(1);
        stealee.download_rate = 1.0;
        stealee.existing_requests = keep.clone();
        let first_stealer = base_peer(2);
        let second_stealer = base_peer(3);

        let results = plan_requests(&[one_piece_torrent(
            chunk_range(9),
            vec![first_stealer, stealee, second_stealer],
        )]);

        assert_eq!(results.len(), 3);
        check(&results[&2], 3);
        check(&results[&3], 3);
        assert_eq!(
            results[&1],
            PeerRequestState {
                interested: true,
                requests: keep,
            }
        );
    }

    #[test]
    fn test_shared_capacity_admits_first_torrent_only() {
        let capacity = Arc::new(Capacity::new(4));
        let make = |stable_id: usize, peer_key: PeerKey| TorrentSnapshot {
            stable_id,
            max_unverified_bytes: 0,
            capacity: Some(Arc::clone(&capacity)),
            pieces: vec![PieceSnapshot {
                request: true,
                priority: PiecePriority::Normal,
                partial: false,
                availability: 0,
                length: 4,
                pending_chunks: chunk_range(4),
            }],
            peers: vec![base_peer(peer_key)],
        };

        let results = plan_requests(&[make(0, 1), make(1, 2)]);

        // First in sort order claims the budget; the other gets nothing.
        assert_eq!(results[&1].requests.len(), 4);
        assert!(results[&2].requests.is_empty());
    }

    #[test]
    fn test_unverified_bytes_ceiling() {
        let piece_len = 8u64;
        let pieces = (0..5)
            .map(|_| PieceSnapshot {
                request: true,
                priority: PiecePriority::Normal,
                partial: false,
                availability: 0,
                length: piece_len,
                pending_chunks: chunk_range(1),
            })
            .collect();
        let torrent = TorrentSnapshot {
            stable_id: 0,
            max_unverified_bytes: 2 * piece_len,
            capacity: None,
            pieces,
            peers: (1..=5).map(base_peer).collect(),
        };

        let results = plan_requests(&[torrent]);
        let assigned: usize = results.values().map(|s| s.requests.len()).sum();
        assert_eq!(assigned, 2);
    }

    // T2: outstanding requests never exceed min(peer reqq, planner cap).
    #[test]
    fn test_per_peer_request_cap() {
        let mut peer = base_peer(1);
        peer.max_requests = 3;
        let results = plan_requests(&[one_piece_torrent(chunk_range(10), vec![peer])]);
        assert_eq!(results[&1].requests.len(), 3);

        let wide = base_peer(2);
        let results = plan_requests(&[one_piece_torrent(chunk_range(64), vec![wide])]);
        assert_eq!(results[&2].requests.len(), MAX_PLANNED_REQUESTS);
    }

    // T5: every planned request maps to a pending chunk of its piece.
    #[test]
    fn test_planned_requests_are_pending_chunks() {
        let pending = chunks(&[0, 2, 5, 7]);
        let torrent = one_piece_torrent(pending.clone(), vec![base_peer(1), base_peer(2)]);
        let results = plan_requests(&[torrent]);
        for state in results.values() {
            for request in &state.requests {
                assert_eq!(request.index, 0);
                assert!(pending.contains(&request.chunk));
            }
        }
        let total: usize = results.values().map(|s| s.requests.len()).sum();
        assert_eq!(total, pending.len());
    }

    #[test]
    fn test_choked_peer_marked_interested_but_skipped() {
        let mut choked = base_peer(1);
        choked.choking = true;
        let results = plan_requests(&[one_piece_torrent(chunk_range(2), vec![choked])]);
        assert!(results[&1].requests.is_empty());
        assert!(results[&1].interested);
    }

    #[test]
    fn test_allowed_fast_requested_while_choked() {
        let mut choked = base_peer(1);
        choked.choking = true;
        choked.allowed_fast.insert(0);
        let results = plan_requests(&[one_piece_torrent(chunk_range(2), vec![choked])]);
        assert_eq!(results[&1].requests.len(), 2);
    }

    #[test]
    fn test_piece_order_prefers_priority_then_partial_then_rarity() {
        let piece = |priority, partial, availability| PieceSnapshot {
            request: true,
            priority,
            partial,
            availability,
            length: 1,
            pending_chunks: chunk_range(1),
        };
        let mut peer = base_peer(1);
        peer.max_requests = 1;
        let torrent = TorrentSnapshot {
            stable_id: 0,
            max_unverified_bytes: 0,
            capacity: None,
            pieces: vec![
                piece(PiecePriority::Normal, false, 1),
                piece(PiecePriority::Now, false, 9),
                piece(PiecePriority::Normal, true, 9),
            ],
            peers: vec![peer],
        };

        let results = plan_requests(&[torrent]);
        let only: Vec<_> = results[&1].requests.iter().collect();
        // The reader-priority piece wins over partial and rarity.
        assert_eq!(only[0].index, 1);
    }
}
