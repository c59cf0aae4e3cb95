//! Outbound side of one client connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

/// Cheap, cloneable handle for queueing messages to one client.
///
/// Sends never block. Queued bytes are counted until the writer task has
/// handed them to the socket; crossing `max_buffered_bytes` trips the
/// `overflowed` token and the connection is dropped.
#[derive(Debug, Clone)]
pub struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
    max_buffered_bytes: usize,
    overflowed: CancellationToken,
}

/// Receiving half, drained by `write_loop`.
#[derive(Debug)]
pub struct PeerQueue {
    rx: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicUsize>,
}

impl Peer {
    pub fn new(max_buffered_bytes: usize) -> (Self, PeerQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let peer = Self {
            tx,
            buffered: buffered.clone(),
            max_buffered_bytes,
            overflowed: CancellationToken::new(),
        };
        (peer, PeerQueue { rx, buffered })
    }

    /// Queue a binary message. Returns false if the client is gone or over
    /// its buffer limit.
    pub fn send_binary(&self, data: bytes::Bytes) -> bool {
        if self.overflowed.is_cancelled() {
            return false;
        }
        let len = data.len();
        let queued = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if self.tx.send(Message::Binary(data)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        if queued > self.max_buffered_bytes {
            tracing::warn!(
                queued,
                limit = self.max_buffered_bytes,
                "client outbound buffer over limit"
            );
            self.overflowed.cancel();
            return false;
        }
        true
    }

    /// Queue a close frame. The writer stops after sending it.
    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Resolves once the outbound buffer limit has been exceeded.
    pub fn overflowed(&self) -> &CancellationToken {
        &self.overflowed
    }
}

impl PeerQueue {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Drain a peer queue into the socket until the queue closes, a close frame
/// has been written, or the socket fails.
pub async fn write_loop<S>(mut writer: S, mut queue: PeerQueue)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = queue.recv().await {
        let is_close = matches!(message, Message::Close(_));
        let len = match &message {
            Message::Binary(data) => data.len(),
            _ => 0,
        };
        let result = writer.send(message).await;
        queue.buffered.fetch_sub(len, Ordering::AcqRel);
        if let Err(e) = result {
            tracing::debug!(error = %e, "client write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    crate::cleanup::best_effort("close client sink", writer.close().await);
}
