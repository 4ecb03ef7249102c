//! ut_metadata message codec (BEP-9).
//!
//! Metadata (the raw info dict) moves in 16 KiB pieces. A data message
//! is a bencoded header dict immediately followed by the raw piece
//! bytes, so decoding needs the length of the first bencode value.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{from_bytes, to_bytes, value_len, Value};

/// Metadata transfers in fixed 16 KiB pieces; only the last is short.
pub const METADATA_PIECE_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_value(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One ut_metadata exchange message.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    /// Present on data messages.
    pub total_size: Option<i64>,
    /// The raw metadata piece, on data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: i64, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Int(self.msg_type as i64),
        );
        dict.insert(Bytes::from_static(b"piece"), Value::Int(self.piece as i64));
        if let Some(total_size) = self.total_size {
            dict.insert(Bytes::from_static(b"total_size"), Value::Int(total_size));
        }
        let mut out = to_bytes(&Value::Dict(dict));
        if let Some(data) = &self.data {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let header_len = value_len(payload)?;
        let header = from_bytes(&payload[..header_len])?;

        let msg_type = header
            .get(b"msg_type")
            .and_then(Value::as_int)
            .and_then(MetadataMessageType::from_value)
            .ok_or_else(|| PeerError::Extension("bad ut_metadata msg_type".into()))?;
        let piece = header
            .get(b"piece")
            .and_then(Value::as_int)
            .filter(|&p| p >= 0)
            .ok_or_else(|| PeerError::Extension("missing ut_metadata piece".into()))?
            as u32;
        let total_size = header.get(b"total_size").and_then(Value::as_int);

        let data = if msg_type == MetadataMessageType::Data {
            Some(Bytes::copy_from_slice(&payload[header_len..]))
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// How many metadata pieces a `metadata_size`-byte info dict takes.
pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// The byte length of one metadata piece.
pub fn metadata_piece_len(piece: u32, metadata_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    metadata_size.saturating_sub(offset).min(METADATA_PIECE_SIZE)
}
