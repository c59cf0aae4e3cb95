//! Glue between the embedded tunnel protocol and the outside world.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// An inbound HTTP request forwarded by the relay.
pub type ProxyRequest = http::Request<RequestBody>;

/// The local answer to a [`ProxyRequest`].
pub type ProxyResponse = http::Response<Bytes>;

/// Caller-supplied handler for proxied requests.
///
/// Implemented for any `Fn(ProxyRequest) -> impl Future<Output =
/// anyhow::Result<ProxyResponse>>`. The handler may take as long as it
/// likes; the tunnel imposes no timeout.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, request: ProxyRequest) -> anyhow::Result<ProxyResponse>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ProxyResponse>> + Send + 'static,
{
    async fn on_request(&self, request: ProxyRequest) -> anyhow::Result<ProxyResponse> {
        (self)(request).await
    }
}

/// Streaming request body. Chunks arrive as the relay sends them; the
/// stream ends when the relay marks the body finished.
#[derive(Debug)]
pub struct RequestBody {
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl RequestBody {
    pub fn empty() -> Self {
        Self { rx: None }
    }

    pub(crate) fn channel() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Some(rx) })
    }

    /// Next chunk, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Buffer the remaining body.
    pub async fn collect_bytes(mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

impl Stream for RequestBody {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// The currently open relay socket, if any.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveSocket {
    inner: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl LiveSocket {
    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn detach(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn send(&self, message: Message) -> bool {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

/// What the embedded protocol gets to talk to: the live socket and the
/// caller's request handler.
#[derive(Clone)]
pub struct TunnelBridge {
    socket: LiveSocket,
    handler: Arc<dyn RequestHandler>,
}

impl std::fmt::Debug for TunnelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelBridge")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl TunnelBridge {
    pub(crate) fn new(socket: LiveSocket, handler: Arc<dyn RequestHandler>) -> Self {
        Self { socket, handler }
    }

    /// Send on the live socket.
    ///
    /// While the tunnel is reconnecting the data is dropped: nothing is
    /// buffered or replayed across a disconnect. Returns whether the data
    /// was queued.
    pub fn send(&self, data: Bytes) -> bool {
        let sent = self.socket.send(Message::Binary(data));
        if !sent {
            tracing::trace!("tunnel not open, dropping outbound frame");
        }
        sent
    }

    /// Hand a proxied request to the caller's handler.
    pub async fn fetch_proxy_request(
        &self,
        request: ProxyRequest,
    ) -> anyhow::Result<ProxyResponse> {
        self.handler.on_request(request).await
    }
}
