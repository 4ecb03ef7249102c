use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::{
    ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_ID, UT_PEX_ID,
};
use super::handshake::ReservedBits;
use super::metadata::MetadataMessage;
use super::peer_id::PeerId;
use super::transport::TransportKind;
use super::writer::MessageQueue;
use crate::constants::{DEFAULT_PEER_REQQ, MAX_OUTSTANDING_REQUESTS, MAX_UPLOAD_REQUEST_LEN};
use crate::pex::PexMessage;
use crate::pieces::Request;
use crate::scheduler::PeerRequestState;
use crate::wire::Message;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// The peer's advertised piece set, which starts unknown and may be
/// set exactly once (a second bitfield or a conflicting fast-extension
/// message is a protocol error).
#[derive(Debug, Clone)]
pub enum PeerPieceState {
    Unknown,
    All,
    Have(Bitfield),
}

/// Something a handled message asks the torrent coordinator to do.
#[derive(Debug)]
pub enum SessionEvent {
    /// The peer choked us; these requests died in flight.
    RequestsCleared(Vec<Request>),
    /// State changed in a way that calls for a scheduler pass.
    NeedReplenish,
    /// The peer declared or withdrew interest in our pieces; the
    /// choking policy reacts.
    PeerInterestChanged(bool),
    /// The peer newly advertises these pieces.
    PeerGainedPieces(Vec<u32>),
    /// The peer advertises every piece.
    PeerHasAll,
    /// The peer wants this chunk uploaded.
    UploadRequested(Request),
    /// A chunk arrived. `was_requested` is false for chunks we never
    /// asked this peer for.
    ChunkReceived {
        index: u32,
        begin: u32,
        data: Bytes,
        was_requested: bool,
    },
    /// The peer's extension handshake (first or refreshed).
    ExtendedHandshake(ExtensionHandshake),
    /// A ut_metadata message.
    Metadata(MetadataMessage),
    /// A ut_pex message.
    Pex(PexMessage),
    /// The peer told us its DHT port.
    DhtPort(u16),
}

/// Per-connection protocol state. One of these per remote peer; the
/// torrent coordinator holds them and runs their read loops.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub transport: TransportKind,
    pub direction: Direction,
    pub encrypted: bool,
    pub peer_id: PeerId,
    pub peer_reserved: ReservedBits,

    pub peer_pieces: PeerPieceState,
    /// Piece count once the torrent has its metadata; bounds bitfield
    /// validation and growth.
    pub known_pieces: Option<usize>,

    /// They choke us.
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// We choke them.
    pub choking: bool,
    pub interested: bool,

    /// Our outstanding requests to this peer.
    pub requests: HashSet<Request>,
    /// Their outstanding requests to us.
    pub peer_requests: HashSet<Request>,
    /// Pieces they allow us to request while choked (BEP-6).
    pub allowed_fast: HashSet<u32>,

    pub useful_chunks_received: u64,
    pub unwanted_chunks_received: u64,
    pub completed_handshake: Instant,
    pub last_message_received: Instant,
    pub last_useful_chunk_received: Option<Instant>,

    /// The peer's advertised request queue depth (`reqq`).
    pub peer_max_requests: usize,
    pub peer_extension_ids: HashMap<String, u8>,
    pub peer_client_name: Option<String>,

    queue: MessageQueue,
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: SocketAddr,
        transport: TransportKind,
        direction: Direction,
        encrypted: bool,
        peer_id: PeerId,
        peer_reserved: ReservedBits,
        queue: MessageQueue,
    ) -> Self {
        let now = Instant::now();
        Self {
            addr,
            transport,
            direction,
            encrypted,
            peer_id,
            peer_reserved,
            peer_pieces: PeerPieceState::Unknown,
            known_pieces: None,
            peer_choking: true,
            peer_interested: false,
            choking: true,
            interested: false,
            requests: HashSet::new(),
            peer_requests: HashSet::new(),
            allowed_fast: HashSet::new(),
            useful_chunks_received: 0,
            unwanted_chunks_received: 0,
            completed_handshake: now,
            last_message_received: now,
            last_useful_chunk_received: None,
            peer_max_requests: DEFAULT_PEER_REQQ,
            peer_extension_ids: HashMap::new(),
            peer_client_name: None,
            queue,
        }
    }

    /// Enqueues an outgoing message; never blocks.
    pub fn post(&self, msg: Message) {
        self.queue.post(msg);
    }

    pub fn post_extended(&self, id: u8, payload: Vec<u8>) {
        self.post(Message::Extended {
            id,
            payload: Bytes::from(payload),
        });
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn close_queue(&self) {
        self.queue.close();
    }

    pub fn supports_extended(&self) -> bool {
        self.peer_reserved.supports_extended()
    }

    pub fn supports_fast(&self) -> bool {
        self.peer_reserved.supports_fast()
    }

    pub fn peer_has_piece(&self, index: usize) -> bool {
        match &self.peer_pieces {
            PeerPieceState::Unknown => false,
            PeerPieceState::All => true,
            PeerPieceState::Have(field) => field.has(index),
        }
    }

    pub fn peer_ut_metadata_id(&self) -> Option<u8> {
        self.peer_extension_ids.get("ut_metadata").copied()
    }

    /// Effective cap on our outstanding requests to this peer.
    pub fn request_ceiling(&self) -> usize {
        self.peer_max_requests.min(MAX_OUTSTANDING_REQUESTS)
    }

    /// Applies a scheduler plan: flips interest and posts the request
    /// and cancel deltas.
    pub fn apply_request_state(&mut self, next: &PeerRequestState) {
        if next.interested != self.interested {
            self.interested = next.interested;
            self.post(if next.interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }

        let cancels: Vec<Request> = self
            .requests
            .iter()
            .filter(|r| !next.requests.contains(r))
            .copied()
            .collect();
        for request in cancels {
            self.requests.remove(&request);
            self.post(Message::Cancel {
                index: request.index,
                begin: request.chunk.begin,
                length: request.chunk.length,
            });
        }

        for request in &next.requests {
            if self.requests.len() >= self.request_ceiling() {
                break;
            }
            if self.requests.insert(*request) {
                self.post(Message::Request {
                    index: request.index,
                    begin: request.chunk.begin,
                    length: request.chunk.length,
                });
            }
        }
    }

    /// Interprets one incoming message, updating session state and
    /// returning work for the coordinator. Errors are fatal to the
    /// session.
    pub fn handle_message(&mut self, msg: Message) -> Result<Vec<SessionEvent>, PeerError> {
        self.last_message_received = Instant::now();
        match msg {
            Message::KeepAlive => Ok(vec![]),
            Message::Choke => {
                self.peer_choking = true;
                let cleared: Vec<Request> = self.requests.drain().collect();
                // Interest survives a choke; only the requests die.
                Ok(vec![SessionEvent::RequestsCleared(cleared)])
            }
            Message::Unchoke => {
                self.peer_choking = false;
                Ok(vec![SessionEvent::NeedReplenish])
            }
            Message::Interested => {
                self.peer_interested = true;
                Ok(vec![SessionEvent::PeerInterestChanged(true)])
            }
            Message::NotInterested => {
                self.peer_interested = false;
                Ok(vec![SessionEvent::PeerInterestChanged(false)])
            }
            Message::Have { index } => self.peer_gained_piece(index),
            Message::Bitfield(bytes) => {
                if !matches!(self.peer_pieces, PeerPieceState::Unknown) {
                    return Err(PeerError::Protocol("unexpected bitfield"));
                }
                let field = match self.known_pieces {
                    Some(n) => Bitfield::from_wire(&bytes, n)
                        .ok_or(PeerError::Protocol("short bitfield"))?,
                    None => Bitfield::from_wire(&bytes, bytes.len() * 8)
                        .ok_or(PeerError::Protocol("short bitfield"))?,
                };
                let gained: Vec<u32> = field.set_indices().map(|i| i as u32).collect();
                self.peer_pieces = PeerPieceState::Have(field);
                Ok(vec![SessionEvent::PeerGainedPieces(gained)])
            }
            Message::HaveAll => {
                if !matches!(self.peer_pieces, PeerPieceState::Unknown) {
                    return Err(PeerError::Protocol("unexpected have-all"));
                }
                self.peer_pieces = PeerPieceState::All;
                Ok(vec![SessionEvent::PeerHasAll])
            }
            Message::HaveNone => {
                if !matches!(self.peer_pieces, PeerPieceState::Unknown) {
                    return Err(PeerError::Protocol("unexpected have-none"));
                }
                self.peer_pieces = PeerPieceState::Have(Bitfield::new(
                    self.known_pieces.unwrap_or(0),
                ));
                Ok(vec![])
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                if length > MAX_UPLOAD_REQUEST_LEN {
                    return Err(PeerError::Protocol("oversized request"));
                }
                let request = Request::new(index, begin, length);
                self.peer_requests.insert(request);
                Ok(vec![SessionEvent::UploadRequested(request)])
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.peer_requests
                    .remove(&Request::new(index, begin, length));
                Ok(vec![])
            }
            Message::Piece { index, begin, data } => {
                let request = Request::new(index, begin, data.len() as u32);
                let was_requested = self.requests.remove(&request);
                Ok(vec![SessionEvent::ChunkReceived {
                    index,
                    begin,
                    data,
                    was_requested,
                }])
            }
            Message::Port(port) => Ok(vec![SessionEvent::DhtPort(port)]),
            Message::SuggestPiece { .. } => Ok(vec![]),
            Message::AllowedFast { index } => {
                self.allowed_fast.insert(index);
                Ok(vec![SessionEvent::NeedReplenish])
            }
            Message::RejectRequest {
                index,
                begin,
                length,
            } => {
                if self.requests.remove(&Request::new(index, begin, length)) {
                    Ok(vec![SessionEvent::NeedReplenish])
                } else {
                    Ok(vec![])
                }
            }
            Message::Extended { id, payload } => match self.handle_extended(id, &payload) {
                Ok(events) => Ok(events),
                // Some clients address extended messages with their own
                // ids instead of ours; tolerate the known offenders.
                Err(err) if self.peer_id.has_buggy_extension_ids() => {
                    tracing::debug!(peer = ?self.peer_id, %err, "ignoring malformed extended message");
                    Ok(vec![])
                }
                Err(err) => Err(err),
            },
        }
    }

    fn peer_gained_piece(&mut self, index: u32) -> Result<Vec<SessionEvent>, PeerError> {
        match &mut self.peer_pieces {
            PeerPieceState::All => Ok(vec![]),
            PeerPieceState::Have(field) => {
                if field.has(index as usize) {
                    return Ok(vec![]);
                }
                if index as usize >= field.len() {
                    match self.known_pieces {
                        // A have beyond the known layout is a violation.
                        Some(_) => return Err(PeerError::Protocol("have out of range")),
                        // Without metadata the layout is open-ended.
                        None => field.grow(index as usize + 1),
                    }
                }
                field.set(index as usize);
                Ok(vec![SessionEvent::PeerGainedPieces(vec![index])])
            }
            PeerPieceState::Unknown => {
                if let Some(n) = self.known_pieces {
                    if index as usize >= n {
                        return Err(PeerError::Protocol("have out of range"));
                    }
                }
                let mut field = Bitfield::new(
                    self.known_pieces.unwrap_or(index as usize + 1),
                );
                field.grow(index as usize + 1);
                field.set(index as usize);
                self.peer_pieces = PeerPieceState::Have(field);
                Ok(vec![SessionEvent::PeerGainedPieces(vec![index])])
            }
        }
    }

    fn handle_extended(
        &mut self,
        id: u8,
        payload: &Bytes,
    ) -> Result<Vec<SessionEvent>, PeerError> {
        match id {
            EXTENSION_HANDSHAKE_ID => {
                let hs = ExtensionHandshake::decode(payload)?;
                for (name, ext_id) in &hs.extensions {
                    self.peer_extension_ids.insert(name.clone(), *ext_id);
                }
                if let Some(reqq) = hs.reqq {
                    if reqq > 0 {
                        self.peer_max_requests = reqq as usize;
                    }
                }
                if let Some(client) = &hs.client {
                    self.peer_client_name = Some(client.clone());
                }
                Ok(vec![SessionEvent::ExtendedHandshake(hs)])
            }
            UT_METADATA_ID => Ok(vec![SessionEvent::Metadata(MetadataMessage::decode(
                payload,
            )?)]),
            UT_PEX_ID => Ok(vec![SessionEvent::Pex(PexMessage::from_bencode(payload)?)]),
            other => Err(PeerError::Extension(format!(
                "unexpected extended message id {other}"
            ))),
        }
    }
}
