//! Gateway module: many WebSocket clients, one shared backend.
//!
//! Each client speaks the multiplexing protocol with stream IDs of its own
//! choosing. The gateway rewrites those IDs into a single global space
//! before handing frames to the backend, and routes backend frames back to
//! the owning client (or to everyone, for even broadcast IDs).
//!
//! All translation state lives in one [`StreamRouter`] behind one mutex.
//! Backend output is drained by a single pump task, so per-stream ordering
//! holds in both directions.

mod backend;
mod listen;
mod peer;
mod router;

pub use backend::{
    BROADCAST_REQUEST, Backend, BackendSender, ECHO_BROADCAST_ID, EchoBackend,
};
pub use listen::{ListenTarget, resolve_listen_addr};
pub use peer::{Peer, PeerQueue, write_loop};
pub use router::{ClientId, DropReason, Route, StreamRouter};

use crate::protocol::{Frame, FrameError};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

// ── Constants ───────────────────────────────────────────────────────────────

/// Default per-client outbound buffer limit.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

/// How long a closing connection gets to flush its outbound queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub listen: String,
    /// A client whose unsent outbound bytes exceed this is disconnected
    /// with close code 1008.
    pub max_buffered_bytes: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9001".to_string(),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    router: StreamRouter,
    peers: HashMap<ClientId, Peer>,
}

/// Fans many client connections into one backend instance.
pub struct MultiplexGateway {
    state: Mutex<GatewayState>,
    backend: Arc<dyn Backend>,
    options: GatewayOptions,
}

impl std::fmt::Debug for MultiplexGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexGateway")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MultiplexGateway {
    /// Build the backend and start the task that routes its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F, B>(options: GatewayOptions, make_backend: F) -> Arc<Self>
    where
        F: FnOnce(BackendSender) -> B,
        B: Backend,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend: Arc<dyn Backend> = Arc::new(make_backend(BackendSender::new(tx)));
        let gateway = Arc::new(Self {
            state: Mutex::new(GatewayState::default()),
            backend,
            options,
        });
        tokio::spawn(backend_pump(Arc::downgrade(&gateway), rx));
        gateway
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Register a new client connection.
    pub async fn connect(&self, peer: Peer) -> ClientId {
        let mut state = self.state.lock().await;
        let client = state.router.register_client();
        state.peers.insert(client, peer);
        tracing::debug!(client, clients = state.peers.len(), "client connected");
        client
    }

    /// Handle one binary message from a client.
    ///
    /// A decode error is returned to the caller, which closes only that
    /// client's connection.
    pub async fn on_client_message(&self, client: ClientId, data: Bytes) -> Result<(), FrameError> {
        let frame = Frame::decode(data)?;
        let mut state = self.state.lock().await;
        let frame = state.router.route_inbound(client, frame);
        // Forwarding happens under the lock so per-stream order is the
        // order frames were routed in.
        self.backend.handle_message(frame.encode());
        Ok(())
    }

    /// Handle one encoded frame emitted by the backend.
    pub async fn on_backend_message(&self, data: Bytes) {
        let mut frame = match Frame::decode(data.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed backend frame");
                return;
            }
        };

        let mut state = self.state.lock().await;
        match state.router.route_outbound(&frame) {
            Route::Deliver { client, local_id } => {
                let Some(peer) = state.peers.get(&client) else {
                    tracing::trace!(client, "owner has no live connection");
                    return;
                };
                frame.stream_id = local_id;
                peer.send_binary(frame.encode());
            }
            Route::Broadcast => {
                tracing::trace!(
                    stream_id = frame.stream_id,
                    clients = state.peers.len(),
                    "broadcasting backend frame"
                );
                for peer in state.peers.values() {
                    peer.send_binary(data.clone());
                }
            }
            Route::Drop(reason) => {
                tracing::trace!(stream_id = frame.stream_id, ?reason, "dropping backend frame");
            }
        }
    }

    /// Tear down a client: every stream it owned gets a synthesized CLOSE
    /// so the backend can release its side, then all mappings go.
    pub async fn on_client_disconnect(&self, client: ClientId) {
        let mut state = self.state.lock().await;
        state.peers.remove(&client);
        let owned = state.router.remove_client(client);
        for global_id in &owned {
            self.backend.handle_message(Frame::close(*global_id).encode());
        }
        tracing::debug!(
            client,
            closed_streams = owned.len(),
            clients = state.peers.len(),
            "client disconnected"
        );
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn stream_count(&self) -> usize {
        self.state.lock().await.router.stream_count()
    }

    pub async fn global_id(&self, client: ClientId, local_id: u32) -> Option<u32> {
        self.state.lock().await.router.global_id(client, local_id)
    }
}

/// Route backend output until the backend's senders are gone or the
/// gateway has been dropped.
async fn backend_pump(gateway: Weak<MultiplexGateway>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        let Some(gateway) = gateway.upgrade() else {
            break;
        };
        gateway.on_backend_message(data).await;
    }
    tracing::debug!("backend pump stopped");
}

/// Run the gateway WebSocket server.
///
/// Accepts connections in a loop until the `cancel` token is triggered,
/// at which point the server stops accepting and open connections are
/// closed.
pub async fn run_gateway(
    listener: TcpListener,
    gateway: Arc<MultiplexGateway>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Gateway listener has no address")?;
    tracing::info!(%addr, "gateway listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let gateway = gateway.clone();
                let child_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, gateway, child_cancel).await {
                        tracing::debug!(%peer, error = %err, "gateway connection error");
                    }
                });
            }
        }
    }

    tracing::info!(%addr, "gateway stopped");
    Ok(())
}

/// Bind `options.listen` and run until cancelled.
pub async fn serve(gateway: Arc<MultiplexGateway>, cancel: CancellationToken) -> Result<()> {
    let addr = resolve_listen_addr(&gateway.options().listen).await?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {}", addr))?;
    run_gateway(listener, gateway, cancel).await
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<MultiplexGateway>,
    cancel: CancellationToken,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (writer, mut reader) = ws_stream.split();

    let (peer, queue) = Peer::new(gateway.options().max_buffered_bytes);
    let writer_task = tokio::spawn(write_loop(writer, queue));
    let client = gateway.connect(peer.clone()).await;
    tracing::debug!(client, %peer_addr, "client accepted");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                peer.close(CloseCode::Away, "gateway shutting down");
                break;
            }
            _ = peer.overflowed().cancelled() => {
                peer.close(CloseCode::Policy, "outbound buffer limit exceeded");
                break;
            }
            msg = reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = gateway.on_client_message(client, data).await {
                        tracing::info!(client, error = %e, "closing client after malformed frame");
                        peer.close(CloseCode::Protocol, "malformed frame");
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    tracing::info!(client, "closing client after text frame");
                    peer.close(CloseCode::Unsupported, "binary frames only");
                    break;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client, error = %e, "client read failed");
                    break;
                }
            }
        }
    }

    gateway.on_client_disconnect(client).await;
    // With the registry's clone gone, dropping ours closes the queue and
    // lets the writer finish.
    drop(peer);
    crate::cleanup::best_effort(
        "drain client writer",
        tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;
    use std::sync::Mutex as StdMutex;

    /// Backend that records everything it is handed.
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Frame>>,
    }

    struct RecordingBackend {
        log: Arc<Recorder>,
    }

    impl Backend for RecordingBackend {
        fn handle_message(&self, data: Bytes) {
            let frame = Frame::decode(data).expect("gateway forwards valid frames");
            self.log.seen.lock().unwrap().push(frame);
        }
    }

    fn recording_gateway() -> (Arc<MultiplexGateway>, Arc<Recorder>, BackendSender) {
        let log = Arc::new(Recorder::default());
        let sender_slot = Arc::new(StdMutex::new(None));
        let slot = sender_slot.clone();
        let backend_log = log.clone();
        let gateway = MultiplexGateway::start(GatewayOptions::default(), move |sender| {
            *slot.lock().unwrap() = Some(sender);
            RecordingBackend { log: backend_log }
        });
        let sender = sender_slot.lock().unwrap().take().unwrap();
        (gateway, log, sender)
    }

    async fn recv_frame(queue: &mut PeerQueue) -> Frame {
        let msg = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("frame should arrive")
            .expect("queue open");
        match msg {
            Message::Binary(data) => Frame::decode(data).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_frames_reach_backend_with_global_ids() {
        let (gateway, log, _sender) = recording_gateway();
        let (peer_a, _qa) = Peer::new(1024);
        let (peer_b, _qb) = Peer::new(1024);
        let a = gateway.connect(peer_a).await;
        let b = gateway.connect(peer_b).await;

        gateway.on_client_message(a, Frame::data(1, &b"a"[..]).encode()).await.unwrap();
        gateway.on_client_message(b, Frame::data(1, &b"b"[..]).encode()).await.unwrap();

        let seen = log.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].stream_id, seen[1].stream_id);
        assert_eq!(&seen[0].payload[..], b"a");
        assert_eq!(&seen[1].payload[..], b"b");
    }

    #[tokio::test]
    async fn malformed_client_frame_is_reported_and_forwards_nothing() {
        let (gateway, log, _sender) = recording_gateway();
        let (peer, _q) = Peer::new(1024);
        let a = gateway.connect(peer).await;
        let err = gateway
            .on_client_message(a, Bytes::from_static(&[0, 1]))
            .await
            .unwrap_err();
        assert_eq!(err, FrameError::Truncated { len: 2 });
        assert!(log.seen.lock().unwrap().is_empty());
        assert_eq!(gateway.stream_count().await, 0);
    }

    #[tokio::test]
    async fn backend_reply_is_rewritten_to_local_id() {
        let (gateway, _log, sender) = recording_gateway();
        let (peer, mut queue) = Peer::new(1024);
        let a = gateway.connect(peer).await;
        gateway.on_client_message(a, Frame::data(7, &b"q"[..]).encode()).await.unwrap();
        let global = gateway.global_id(a, 7).await.unwrap();

        sender.send(Frame::data(global, &b"r"[..]).encode());
        let reply = recv_frame(&mut queue).await;
        assert_eq!(reply.stream_id, 7);
        assert_eq!(&reply.payload[..], b"r");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_unmodified() {
        let (gateway, _log, sender) = recording_gateway();
        let (pa, mut qa) = Peer::new(1024);
        let (pb, mut qb) = Peer::new(1024);
        gateway.connect(pa).await;
        gateway.connect(pb).await;

        sender.send(Frame::data(4, &b"all"[..]).encode());
        for queue in [&mut qa, &mut qb] {
            let frame = recv_frame(queue).await;
            assert_eq!(frame.stream_id, 4);
            assert_eq!(&frame.payload[..], b"all");
        }
    }

    #[tokio::test]
    async fn disconnect_synthesizes_close_for_owned_streams() {
        let (gateway, log, _sender) = recording_gateway();
        let (pa, _qa) = Peer::new(1024);
        let (pb, _qb) = Peer::new(1024);
        let a = gateway.connect(pa).await;
        let b = gateway.connect(pb).await;
        gateway.on_client_message(a, Frame::data(1, &b""[..]).encode()).await.unwrap();
        gateway.on_client_message(a, Frame::data(3, &b""[..]).encode()).await.unwrap();
        gateway.on_client_message(b, Frame::data(1, &b""[..]).encode()).await.unwrap();
        let a1 = gateway.global_id(a, 1).await.unwrap();
        let a3 = gateway.global_id(a, 3).await.unwrap();
        let b1 = gateway.global_id(b, 1).await.unwrap();

        gateway.on_client_disconnect(a).await;

        let seen = log.seen.lock().unwrap().clone();
        let closes: Vec<u32> = seen
            .iter()
            .filter(|f| f.frame_type == FrameType::Close)
            .map(|f| f.stream_id)
            .collect();
        assert_eq!(closes, vec![a1.min(a3), a1.max(a3)]);
        assert_eq!(gateway.client_count().await, 1);
        assert_eq!(gateway.global_id(b, 1).await, Some(b1));
        assert_eq!(gateway.stream_count().await, 1);
    }

    #[tokio::test]
    async fn frames_for_freed_ids_are_dropped() {
        let (gateway, _log, sender) = recording_gateway();
        let (pa, _qa) = Peer::new(1024);
        let (pb, mut qb) = Peer::new(1024);
        let a = gateway.connect(pa).await;
        gateway.connect(pb).await;
        gateway.on_client_message(a, Frame::data(1, &b""[..]).encode()).await.unwrap();
        let global = gateway.global_id(a, 1).await.unwrap();
        gateway.on_client_disconnect(a).await;

        sender.send(Frame::data(global, &b"late"[..]).encode());
        // A broadcast after the late frame proves the pump has moved past it.
        sender.send(Frame::data(6, &b"marker"[..]).encode());
        let next = recv_frame(&mut qb).await;
        assert_eq!(&next.payload[..], b"marker");
    }

    #[tokio::test]
    async fn malformed_backend_frame_does_not_stop_routing() {
        let (gateway, _log, sender) = recording_gateway();
        let (pa, mut qa) = Peer::new(1024);
        gateway.connect(pa).await;
        sender.send(Bytes::from_static(&[9, 9]));
        sender.send(Frame::data(2, &b"still here"[..]).encode());
        let frame = recv_frame(&mut qa).await;
        assert_eq!(&frame.payload[..], b"still here");
    }
}
