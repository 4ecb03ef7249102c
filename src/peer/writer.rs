use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::wire::{Message, MessageCodec, WireError};

/// The outgoing side of a session: a non-blocking queue drained by one
/// writer task.
///
/// Posting merges where the protocol allows it: a `Cancel` for a
/// `Request` still sitting in the queue deletes the request instead of
/// sending both, and a `Have` folds into a queued `Bitfield`. The
/// writer emits a keep-alive whenever the connection has been
/// write-idle for the keep-alive interval.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueues a message; never blocks.
    pub fn post(&self, msg: Message) {
        let mut queue = self.inner.queue.lock();
        match &msg {
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let target = Message::Request {
                    index: *index,
                    begin: *begin,
                    length: *length,
                };
                if let Some(pos) = queue.iter().position(|m| *m == target) {
                    // The request never hit the wire; drop both sides.
                    queue.remove(pos);
                    return;
                }
                queue.push_back(msg);
            }
            Message::Have { index } => {
                for queued in queue.iter_mut() {
                    if let Message::Bitfield(bits) = queued {
                        let mut updated = BytesMut::from(&bits[..]);
                        let (byte, bit) = (*index as usize / 8, 7 - *index as usize % 8);
                        if byte < updated.len() {
                            updated[byte] |= 1 << bit;
                            *queued = Message::Bitfield(updated.freeze());
                            return;
                        }
                    }
                }
                queue.push_back(msg);
            }
            _ => queue.push_back(msg),
        }
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Stops the writer once the queue drains.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the writer side: pops queued messages and writes them,
    /// inserting keep-alives during idle stretches. Returns when the
    /// queue is closed and empty, or on the first write error.
    pub async fn run_writer<W>(
        &self,
        mut sink: W,
        keepalive: Duration,
    ) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut codec = MessageCodec::new();
        let mut last_write = Instant::now();
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(msg) => {
                    codec.write_message(&mut sink, &msg).await?;
                    last_write = Instant::now();
                }
                None => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    let notified = self.inner.notify.notified();
                    tokio::pin!(notified);
                    if !self.inner.queue.lock().is_empty() {
                        continue;
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(last_write + keepalive) => {
                            codec.write_message(&mut sink, &Message::KeepAlive).await?;
                            last_write = Instant::now();
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<Message> {
        self.inner.queue.lock().iter().cloned().collect()
    }
}
