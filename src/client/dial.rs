use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::constants::MIN_DIAL_TIMEOUT;
use crate::peer::{BoxedStream, StreamDialer, TransportKind};

/// Scales the dial timeout down as half-open dials pile up, so a burst
/// of new addresses cycles through the half-open budget instead of
/// serializing behind full-length timeouts.
pub fn reduced_dial_timeout(
    nominal: Duration,
    half_open_limit: usize,
    pending_peers: usize,
) -> Duration {
    let divisor = ((pending_peers + half_open_limit) / half_open_limit.max(1)).max(1) as u32;
    (nominal / divisor).max(MIN_DIAL_TIMEOUT)
}

/// Dials `addr` over every enabled transport at once and keeps the
/// first stream that lands; the laggard is closed on drop.
pub async fn dial_race(
    addr: SocketAddr,
    tcp_enabled: bool,
    utp_dialer: Option<Arc<dyn StreamDialer>>,
    timeout: Duration,
) -> std::io::Result<(BoxedStream, TransportKind)> {
    type DialResult = std::io::Result<(BoxedStream, TransportKind)>;
    let mut in_flight = 0usize;
    let (tx, mut rx) = mpsc::channel::<DialResult>(2);

    if tcp_enabled {
        let tx = tx.clone();
        in_flight += 1;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
                .map(|stream| {
                    let _ = stream.set_nodelay(true);
                    (Box::new(stream) as BoxedStream, TransportKind::Tcp)
                });
            let _ = tx.send(result).await;
        });
    }
    if let Some(dialer) = utp_dialer {
        let tx = tx.clone();
        let kind = dialer.kind();
        in_flight += 1;
        tokio::spawn(async move {
            let result = dialer.dial(addr, timeout).await.map(|s| (s, kind));
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    if in_flight == 0 {
        return Err(std::io::Error::other("all transports disabled"));
    }

    let mut last_err: std::io::Error = std::io::ErrorKind::TimedOut.into();
    while let Some(result) = rx.recv().await {
        match result {
            // Any still-racing dial resolves into a closed channel and
            // its stream drops.
            Ok(won) => return Ok(won),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
