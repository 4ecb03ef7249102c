use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::WireError;
use super::message::Message;

/// Frames above this are a fatal session error. Generous enough for a
/// bitfield of any realistic torrent and a 16 KiB chunk with headroom.
pub const MAX_FRAME_LEN: u32 = 256 * 1024;

/// Length-prefixed message framing over a byte stream.
///
/// One codec instance serves one peer session; sessions decode in
/// parallel with each other. Reads buffer into an internal `BytesMut`
/// so short network reads never split a frame.
pub struct MessageCodec {
    buf: BytesMut,
    max_frame_len: u32,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    #[cfg(test)]
    pub fn with_max_frame_len(max_frame_len: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_frame_len,
        }
    }

    /// Reads one complete message from `stream`.
    pub async fn read_message<S>(&mut self, stream: &mut S) -> Result<Message, WireError>
    where
        S: AsyncRead + Unpin,
    {
        while self.buf.len() < 4 {
            self.fill(stream).await?;
        }
        let frame_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if frame_len > self.max_frame_len {
            return Err(WireError::FrameTooLarge(frame_len));
        }

        let total = 4 + frame_len as usize;
        while self.buf.len() < total {
            self.fill(stream).await?;
        }

        self.buf.advance(4);
        let payload = self.buf.split_to(frame_len as usize).freeze();
        Message::decode(payload)
    }

    /// Writes one message to `stream`, flushing it.
    pub async fn write_message<S>(&mut self, stream: &mut S, msg: &Message) -> Result<(), WireError>
    where
        S: AsyncWrite + Unpin,
    {
        let frame = msg.encode();
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<(), WireError>
    where
        S: AsyncRead + Unpin,
    {
        let n = stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(WireError::Closed);
        }
        Ok(())
    }
}
