//! Peer Exchange message codec (ut_pex, BEP-11).
//!
//! PEX messages ride the extension protocol and carry compact peer
//! lists: `added` (6 bytes per IPv4 peer), `added.f` (one flag byte per
//! added peer), `dropped`, and the IPv6 variants `added6`/`added6.f`.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::bencode::{from_bytes, to_bytes, BencodeError, Value};

/// Capability flags attached to an exchanged peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags {
    pub prefers_encryption: bool,
    pub seed: bool,
    pub supports_utp: bool,
    pub supports_holepunch: bool,
    pub reachable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            prefers_encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
            supports_utp: b & 0x04 != 0,
            supports_holepunch: b & 0x08 != 0,
            reachable: b & 0x10 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.prefers_encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.supports_utp {
            b |= 0x04;
        }
        if self.supports_holepunch {
            b |= 0x08;
        }
        if self.reachable {
            b |= 0x10;
        }
        b
    }
}

/// One ut_pex update: who joined the swarm, who left.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<(SocketAddr, PexFlags)>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    /// Decodes an extension payload.
    pub fn from_bencode(payload: &[u8]) -> Result<Self, BencodeError> {
        let root = from_bytes(payload)?;
        let mut msg = PexMessage::default();

        let added4 = root
            .get(b"added")
            .and_then(Value::as_str_bytes)
            .map(|b| decode_compact_v4(b))
            .unwrap_or_default();
        let flags4 = root
            .get(b"added.f")
            .and_then(Value::as_str_bytes)
            .cloned()
            .unwrap_or_default();
        for (i, addr) in added4.into_iter().enumerate() {
            let flags = flags4
                .get(i)
                .copied()
                .map(PexFlags::from_byte)
                .unwrap_or_default();
            msg.added.push((addr, flags));
        }

        let added6 = root
            .get(b"added6")
            .and_then(Value::as_str_bytes)
            .map(|b| decode_compact_v6(b))
            .unwrap_or_default();
        let flags6 = root
            .get(b"added6.f")
            .and_then(Value::as_str_bytes)
            .cloned()
            .unwrap_or_default();
        for (i, addr) in added6.into_iter().enumerate() {
            let flags = flags6
                .get(i)
                .copied()
                .map(PexFlags::from_byte)
                .unwrap_or_default();
            msg.added.push((addr, flags));
        }

        if let Some(b) = root.get(b"dropped").and_then(Value::as_str_bytes) {
            msg.dropped.extend(decode_compact_v4(b));
        }
        if let Some(b) = root.get(b"dropped6").and_then(Value::as_str_bytes) {
            msg.dropped.extend(decode_compact_v6(b));
        }

        Ok(msg)
    }

    /// Encodes to an extension payload.
    pub fn to_bencode(&self) -> Vec<u8> {
        let mut added4 = BytesMut::new();
        let mut flags4 = BytesMut::new();
        let mut added6 = BytesMut::new();
        let mut flags6 = BytesMut::new();
        for (addr, flags) in &self.added {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    added4.put_slice(&ip.octets());
                    added4.put_u16(addr.port());
                    flags4.put_u8(flags.to_byte());
                }
                IpAddr::V6(ip) => {
                    added6.put_slice(&ip.octets());
                    added6.put_u16(addr.port());
                    flags6.put_u8(flags.to_byte());
                }
            }
        }
        let mut dropped4 = BytesMut::new();
        let mut dropped6 = BytesMut::new();
        for addr in &self.dropped {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    dropped4.put_slice(&ip.octets());
                    dropped4.put_u16(addr.port());
                }
                IpAddr::V6(ip) => {
                    dropped6.put_slice(&ip.octets());
                    dropped6.put_u16(addr.port());
                }
            }
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"added"), Value::Str(added4.freeze()));
        dict.insert(Bytes::from_static(b"added.f"), Value::Str(flags4.freeze()));
        if !added6.is_empty() {
            dict.insert(Bytes::from_static(b"added6"), Value::Str(added6.freeze()));
            dict.insert(Bytes::from_static(b"added6.f"), Value::Str(flags6.freeze()));
        }
        dict.insert(Bytes::from_static(b"dropped"), Value::Str(dropped4.freeze()));
        if !dropped6.is_empty() {
            dict.insert(Bytes::from_static(b"dropped6"), Value::Str(dropped6.freeze()));
        }
        to_bytes(&Value::Dict(dict))
    }
}

fn decode_compact_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(c[0], c[1], c[2], c[3])),
                u16::from_be_bytes([c[4], c[5]]),
            )
        })
        .collect()
}

fn decode_compact_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([c[16], c[17]]),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_round_trip() {
        for b in 0..=0x1f {
            assert_eq!(PexFlags::from_byte(b).to_byte(), b);
        }
    }

    #[test]
    fn test_message_round_trip() {
        let msg = PexMessage {
            added: vec![
                (
                    "1.2.3.4:6881".parse().unwrap(),
                    PexFlags {
                        seed: true,
                        ..Default::default()
                    },
                ),
                (
                    "[2001:db8::2]:51413".parse().unwrap(),
                    PexFlags {
                        supports_utp: true,
                        ..Default::default()
                    },
                ),
            ],
            dropped: vec!["9.8.7.6:1024".parse().unwrap()],
        };

        let decoded = PexMessage::from_bencode(&msg.to_bencode()).unwrap();
        // IPv4 entries come back before IPv6 ones.
        assert_eq!(decoded.added.len(), 2);
        assert_eq!(decoded.added[0].0, "1.2.3.4:6881".parse().unwrap());
        assert!(decoded.added[0].1.seed);
        assert_eq!(decoded.added[1].0, "[2001:db8::2]:51413".parse().unwrap());
        assert!(decoded.added[1].1.supports_utp);
        assert_eq!(decoded.dropped, msg.dropped);
    }

    #[test]
    fn test_missing_flags_default() {
        // A dict with added peers but no added.f.
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"added"),
            Value::Str(Bytes::from_static(&[10, 0, 0, 1, 0x1a, 0xe1])),
        );
        let payload = to_bytes(&Value::Dict(dict));
        let msg = PexMessage::from_bencode(&payload).unwrap();
        assert_eq!(msg.added.len(), 1);
        assert_eq!(msg.added[0].1, PexFlags::default());
    }
}
