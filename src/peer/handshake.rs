use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::PeerError;
use super::peer_id::PeerId;
use crate::metainfo::InfoHash;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// The reserved bytes of the BT handshake, as capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReservedBits(pub [u8; 8]);

impl ReservedBits {
    /// The capabilities this client always advertises: extension
    /// protocol (BEP-10), DHT (BEP-5), fast extension (BEP-6).
    pub fn ours() -> Self {
        let mut bits = [0u8; 8];
        bits[5] |= 0x10;
        bits[7] |= 0x01;
        bits[7] |= 0x04;
        Self(bits)
    }

    pub fn supports_extended(&self) -> bool {
        self.0[5] & 0x10 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.0[7] & 0x01 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.0[7] & 0x04 != 0
    }
}

/// One side's 68-byte handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: ReservedBits,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL);
        out[20..28].copy_from_slice(&self.reserved.0);
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(self.peer_id.as_bytes());
        out
    }

    pub fn decode(data: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::BadHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            reserved: ReservedBits(reserved),
            info_hash: InfoHash(info_hash),
            peer_id: PeerId::from_bytes(peer_id),
        })
    }
}

/// Exchanges BT handshakes on a fresh stream.
///
/// With `info_hash` known (we dialed), the whole handshake goes out
/// eagerly. Without it (they dialed), only the fixed head is sent;
/// the infohash and peer id follow once the peer reveals which torrent
/// it wants, so the caller can first check it serves that torrent via
/// `accept`.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    info_hash: Option<InfoHash>,
    peer_id: PeerId,
    accept: impl FnOnce(&Handshake) -> bool,
) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reserved = ReservedBits::ours();
    if let Some(info_hash) = info_hash {
        let ours = Handshake {
            reserved,
            info_hash,
            peer_id,
        };
        stream.write_all(&ours.encode()).await?;
        stream.flush().await?;
    } else {
        let mut head = [0u8; 28];
        head[0] = PROTOCOL.len() as u8;
        head[1..20].copy_from_slice(PROTOCOL);
        head[20..28].copy_from_slice(&reserved.0);
        stream.write_all(&head).await?;
        stream.flush().await?;
    }

    let mut raw = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut raw).await?;
    let theirs = Handshake::decode(&raw)?;

    if let Some(info_hash) = info_hash {
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
    }
    if !accept(&theirs) {
        return Err(PeerError::InfoHashMismatch);
    }
    if info_hash.is_none() {
        // Now that we know the torrent, finish our side.
        let mut tail = [0u8; 40];
        tail[..20].copy_from_slice(theirs.info_hash.as_bytes());
        tail[20..].copy_from_slice(peer_id.as_bytes());
        stream.write_all(&tail).await?;
        stream.flush().await?;
    }

    Ok(theirs)
}
