use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// What an announce returns: how long to wait, and who to dial.
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Seconds until the tracker wants to hear from us again.
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeder count, when reported.
    pub complete: Option<u32>,
    /// Leecher count, when reported.
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// Parses the compact IPv4 peer form: 6 bytes per peer, 4 of address
/// and 2 of port, both big-endian. Trailing partial entries are
/// ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses the compact IPv6 peer form: 18 bytes per peer.
pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}
