use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::WireError;

/// Wire message type ids. Every message except the keep-alive carries
/// one of these after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::SuggestPiece,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::RejectRequest,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(WireError::UnknownMessageId(other)),
        })
    }
}

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    SuggestPiece { index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { index: u32, begin: u32, length: u32 },
    AllowedFast { index: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => Self::put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => Self::put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => Self::put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { index } => Self::put_index(&mut buf, MessageId::Have, *index),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Request, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Cancel, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::SuggestPiece { index } => {
                Self::put_index(&mut buf, MessageId::SuggestPiece, *index)
            }
            Message::HaveAll => Self::put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => Self::put_bare(&mut buf, MessageId::HaveNone),
            Message::RejectRequest {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::RejectRequest, *index, *begin, *length),
            Message::AllowedFast { index } => {
                Self::put_index(&mut buf, MessageId::AllowedFast, *index)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decodes one frame, given its payload (everything after the length
    /// prefix). An empty payload is a keep-alive.
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = MessageId::try_from(payload.get_u8())?;
        Ok(match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                index: take_u32(&mut payload, "have")?,
            },
            MessageId::Bitfield => Message::Bitfield(payload),
            MessageId::Request => Message::Request {
                index: take_u32(&mut payload, "request")?,
                begin: take_u32(&mut payload, "request")?,
                length: take_u32(&mut payload, "request")?,
            },
            MessageId::Piece => {
                if payload.remaining() < 8 {
                    return Err(WireError::ShortPayload("piece"));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            MessageId::Cancel => Message::Cancel {
                index: take_u32(&mut payload, "cancel")?,
                begin: take_u32(&mut payload, "cancel")?,
                length: take_u32(&mut payload, "cancel")?,
            },
            MessageId::Port => {
                if payload.remaining() < 2 {
                    return Err(WireError::ShortPayload("port"));
                }
                Message::Port(payload.get_u16())
            }
            MessageId::SuggestPiece => Message::SuggestPiece {
                index: take_u32(&mut payload, "suggest")?,
            },
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::RejectRequest => Message::RejectRequest {
                index: take_u32(&mut payload, "reject")?,
                begin: take_u32(&mut payload, "reject")?,
                length: take_u32(&mut payload, "reject")?,
            },
            MessageId::AllowedFast => Message::AllowedFast {
                index: take_u32(&mut payload, "allowed fast")?,
            },
            MessageId::Extended => {
                if payload.remaining() < 1 {
                    return Err(WireError::ShortPayload("extended"));
                }
                let id = payload.get_u8();
                Message::Extended { id, payload }
            }
        })
    }

    /// Total encoded size including the length prefix.
    pub fn frame_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. }
            | Message::SuggestPiece { .. }
            | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } | Message::RejectRequest { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port(_) => 3,
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    fn put_bare(buf: &mut BytesMut, id: MessageId) {
        buf.put_u32(1);
        buf.put_u8(id as u8);
    }

    fn put_index(buf: &mut BytesMut, id: MessageId, index: u32) {
        buf.put_u32(5);
        buf.put_u8(id as u8);
        buf.put_u32(index);
    }

    fn put_triple(buf: &mut BytesMut, id: MessageId, index: u32, begin: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(index);
        buf.put_u32(begin);
        buf.put_u32(length);
    }
}

fn take_u32(payload: &mut Bytes, what: &'static str) -> Result<u32, WireError> {
    if payload.remaining() < 4 {
        return Err(WireError::ShortPayload(what));
    }
    Ok(payload.get_u32())
}
