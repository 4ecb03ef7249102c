use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

/// Whether a connection runs over TCP or uTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Utp,
}

pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<BoxedStream>> + Send>>;

/// An alternative way to reach peers. TCP is built in; a uTP
/// implementation plugs in here and gets raced against TCP on every
/// outgoing dial.
pub trait StreamDialer: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> DialFuture;
}

/// Any duplex byte stream a session can run over: a TCP socket, a uTP
/// stream from an injected dialer, or an MSE-encrypted wrapper around
/// either.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A stream with already-consumed bytes pushed back in front, used
/// when the accept path sniffs the first bytes to pick plaintext or
/// MSE before the real handshake runs.
pub struct Rewound<S> {
    prefix: bytes::BytesMut,
    inner: S,
}

impl<S> Rewound<S> {
    pub fn new(prefix: &[u8], inner: S) -> Self {
        Self {
            prefix: bytes::BytesMut::from(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewound<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if !me.prefix.is_empty() {
            use bytes::Buf;
            let n = me.prefix.len().min(buf.remaining());
            buf.put_slice(&me.prefix[..n]);
            me.prefix.advance(n);
            return std::task::Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewound<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
