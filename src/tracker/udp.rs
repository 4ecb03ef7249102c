use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use super::error::TrackerError;
use super::response::parse_compact_peers;
use super::{AnnounceRequest, AnnounceResponse};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Per BEP-15 a connection id may be reused for a minute.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Base timeout for one request attempt; doubles per retry.
const RETRY_BASE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 3;

/// A UDP tracker endpoint (BEP-15): connect handshake, then announces
/// carrying the 16-byte connection id it issued.
pub struct UdpTracker {
    host: String,
    connection: Mutex<Option<(u64, Instant)>>,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let rest = url
            .strip_prefix("udp://")
            .ok_or_else(|| TrackerError::BadUrl(url.to_string()))?;
        let host = rest.split(['/', '?']).next().unwrap_or("");
        if host.is_empty() {
            return Err(TrackerError::BadUrl(url.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            connection: Mutex::new(None),
        })
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.host).await?;

        let connection_id = match self.cached_connection_id() {
            Some(id) => id,
            None => {
                let id = self.connect(&socket).await?;
                *self.connection.lock() = Some((id, Instant::now()));
                id
            }
        };

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(request.info_hash.as_bytes());
        packet.extend_from_slice(&request.peer_id);
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.udp_value().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP: tracker sees it
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&request.num_want.unwrap_or(-1).to_be_bytes());
        packet.extend_from_slice(&request.port.to_be_bytes());

        let reply = exchange(&socket, &packet, 20).await?;
        if read_u32(&reply, 0) == ACTION_ERROR {
            // Error replies carry the transaction id then a message.
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(&reply[8..]).into_owned(),
            ));
        }
        if read_u32(&reply, 0) != ACTION_ANNOUNCE || read_u32(&reply, 4) != transaction_id {
            return Err(TrackerError::BadResponse("announce reply mismatch".into()));
        }

        let mut response = AnnounceResponse::new(read_u32(&reply, 8));
        response.incomplete = Some(read_u32(&reply, 12));
        response.complete = Some(read_u32(&reply, 16));
        response.peers = parse_compact_peers(&reply[20..]);
        Ok(response)
    }

    fn cached_connection_id(&self) -> Option<u64> {
        let guard = self.connection.lock();
        guard
            .as_ref()
            .filter(|(_, at)| at.elapsed() < CONNECTION_ID_TTL)
            .map(|(id, _)| *id)
    }

    async fn connect(&self, socket: &UdpSocket) -> Result<u64, TrackerError> {
        let transaction_id: u32 = rand::rng().random();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let reply = exchange(socket, &packet, 16).await?;
        if read_u32(&reply, 0) != ACTION_CONNECT || read_u32(&reply, 4) != transaction_id {
            return Err(TrackerError::BadResponse("connect reply mismatch".into()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&reply[8..16]);
        Ok(u64::from_be_bytes(id))
    }
}

/// Sends a packet and waits for a big-enough reply, with exponential
/// backoff across attempts.
async fn exchange(
    socket: &UdpSocket,
    packet: &[u8],
    min_reply_len: usize,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];
    for attempt in 0..MAX_ATTEMPTS {
        socket.send(packet).await?;
        let wait = RETRY_BASE_TIMEOUT * (1 << attempt);
        match timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_reply_len => return Ok(buf[..n].to_vec()),
            Ok(Ok(_)) => {
                return Err(TrackerError::BadResponse("reply too short".into()));
            }
            Ok(Err(e)) => return Err(TrackerError::Io(e)),
            Err(_) => continue,
        }
    }
    Err(TrackerError::Timeout)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
