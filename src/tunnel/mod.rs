//! Reconnecting tunnel client.
//!
//! [`listen`] keeps one logical connection to a relay alive for a given id.
//! The physical WebSocket is reopened with backoff whenever it drops, and
//! every binary message is handed to an embedded [`TunnelProtocol`]
//! instance, which by default is [`ProxyProtocol`] bridging relay requests
//! to the caller's [`RequestHandler`].
//!
//! ```text
//! Idle -> Connecting -> Open -> Reconnecting -> Connecting -> ...
//!                  \________________/
//! any state -> Disposed
//! ```

mod bridge;
mod proxy;

pub use bridge::{ProxyRequest, ProxyResponse, RequestBody, RequestHandler, TunnelBridge};
pub use proxy::{MAX_CHUNK, ProxyProtocol, RequestHead, ResponseHead};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cleanup::best_effort;
use crate::retry::{Backoff, ReconnectPolicy};
use bridge::LiveSocket;

/// Close code reported when the socket went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// An embedded protocol driven by the tunnel.
///
/// One instance lives for the whole lifetime of a tunnel handle and sees
/// every binary message from every physical socket, in order.
pub trait TunnelProtocol: Send {
    /// Handle one binary message from the relay. An error closes the
    /// current socket with code 1011 and reconnects.
    fn handle_message(&mut self, data: Bytes) -> anyhow::Result<()>;

    /// The physical socket is gone. Anything tied to it should be dropped.
    fn on_disconnect(&mut self) {}
}

pub type ProtocolFactory = Box<dyn FnOnce(TunnelBridge) -> Box<dyn TunnelProtocol> + Send>;

type ConnectCallback = Box<dyn Fn() + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(&DisconnectInfo) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&TunnelError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Disposed,
}

/// Why a socket closed, as passed to `on_disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub code: Option<u16>,
    pub reason: String,
}

impl DisconnectInfo {
    fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Some(ABNORMAL_CLOSURE),
            reason: reason.into(),
        }
    }

    fn from_close(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                code: Some(frame.code.into()),
                reason: frame.reason.as_str().to_string(),
            },
            None => Self {
                code: None,
                reason: String::new(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("tunnel id must not be empty")]
    MissingId,

    #[error("relay transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

pub struct TunnelOptions {
    pub relay_url: String,
    pub id: String,
    pub handler: Arc<dyn RequestHandler>,
    pub policy: ReconnectPolicy,
    /// WebSocket ping interval while the socket is open.
    pub keepalive: Option<Duration>,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
    protocol: Option<ProtocolFactory>,
}

impl std::fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("relay_url", &self.relay_url)
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl TunnelOptions {
    pub fn new(
        relay_url: impl Into<String>,
        id: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            id: id.into(),
            handler,
            policy: ReconnectPolicy::tunnel_default(),
            keepalive: None,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
            protocol: None,
        }
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(&DisconnectInfo) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Called for transport errors only. Protocol handler failures close
    /// the socket and reconnect without reaching this callback.
    pub fn on_error(mut self, f: impl Fn(&TunnelError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Replace the default [`ProxyProtocol`].
    pub fn with_protocol<F, P>(mut self, factory: F) -> Self
    where
        F: FnOnce(TunnelBridge) -> P + Send + 'static,
        P: TunnelProtocol + 'static,
    {
        self.protocol = Some(Box::new(move |bridge| {
            Box::new(factory(bridge)) as Box<dyn TunnelProtocol>
        }));
        self
    }
}

/// WebSocket endpoint for a tunnel id: `{relay_url}/{id}`, with `http(s)`
/// mapped to `ws(s)`.
pub fn endpoint_url(relay_url: &str, id: &str) -> Result<Url, TunnelError> {
    let invalid = |reason: String| TunnelError::InvalidRelayUrl {
        url: relay_url.to_string(),
        reason,
    };

    if id.trim().is_empty() {
        return Err(TunnelError::MissingId);
    }
    let mut url = Url::parse(relay_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot change scheme".into()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("url cannot carry a path".into()))?
        .pop_if_empty()
        .push(id);
    Ok(url)
}

/// Handle to a running tunnel. Dropping it disposes the tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    cancel: CancellationToken,
    state: Arc<watch::Sender<TunnelState>>,
    finished: CancellationToken,
}

impl TunnelHandle {
    /// Stop the tunnel: cancels any pending reconnect and closes the open
    /// socket with code 1000. No callback fires afterwards. Calling it
    /// again is a no-op.
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!("disposing tunnel");
        self.cancel.cancel();
        self.state.send_replace(TunnelState::Disposed);
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the background task has released its socket.
    pub async fn wait_closed(&self) {
        self.finished.cancelled().await;
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Start a tunnel for `options.id`. Must be called inside a Tokio runtime.
pub fn listen(options: TunnelOptions) -> Result<TunnelHandle, TunnelError> {
    let url = endpoint_url(&options.relay_url, &options.id)?;

    let cancel = CancellationToken::new();
    let finished = CancellationToken::new();
    let (state, _) = watch::channel(TunnelState::Idle);
    let state = Arc::new(state);

    let socket = LiveSocket::default();
    let bridge = TunnelBridge::new(socket.clone(), options.handler);
    let protocol = match options.protocol {
        Some(factory) => factory(bridge),
        None => Box::new(ProxyProtocol::new(bridge)),
    };

    let runner = Runner {
        url,
        policy: options.policy,
        keepalive: options.keepalive,
        socket,
        protocol,
        state: state.clone(),
        cancel: cancel.clone(),
        on_connect: options.on_connect,
        on_disconnect: options.on_disconnect,
        on_error: options.on_error,
    };
    tokio::spawn(runner.run(finished.clone()));

    Ok(TunnelHandle {
        cancel,
        state,
        finished,
    })
}

/// How one physical session ended.
enum SessionEnd {
    Disposed,
    Closed(DisconnectInfo),
    HandlerFailed(DisconnectInfo),
    Failed(TunnelError),
}

struct Runner {
    url: Url,
    policy: ReconnectPolicy,
    keepalive: Option<Duration>,
    socket: LiveSocket,
    protocol: Box<dyn TunnelProtocol>,
    state: Arc<watch::Sender<TunnelState>>,
    cancel: CancellationToken,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
}

impl Runner {
    async fn run(mut self, finished: CancellationToken) {
        let _finished = finished.drop_guard();
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            if !self.transition(TunnelState::Connecting) {
                break;
            }
            tracing::debug!(
                url = %self.url,
                attempt = backoff.failures() + 1,
                "connecting to relay"
            );

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((ws, _response)) => {
                    backoff.reset();
                    if !self.transition(TunnelState::Open) {
                        break;
                    }
                    tracing::info!(url = %self.url, "tunnel open");
                    if let Some(cb) = self.callback(&self.on_connect) {
                        cb();
                    }

                    let end = self.run_session(ws).await;
                    self.socket.detach();
                    self.protocol.on_disconnect();

                    match end {
                        SessionEnd::Disposed => break,
                        SessionEnd::Closed(info) | SessionEnd::HandlerFailed(info) => {
                            tracing::info!(
                                code = ?info.code,
                                reason = %info.reason,
                                "tunnel closed"
                            );
                            self.disconnected(&info);
                        }
                        SessionEnd::Failed(e) => {
                            tracing::warn!(error = %e, "tunnel socket failed");
                            self.failed(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "relay connect failed");
                    self.failed(TunnelError::Transport(e));
                }
            }

            if !self.transition(TunnelState::Reconnecting) {
                break;
            }
            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(url = %self.url, "tunnel stopped");
    }

    async fn run_session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> SessionEnd {
        let (mut writer, mut reader) = ws.split();
        let (tx, mut outbound) = mpsc::unbounded_channel();
        self.socket.attach(tx);

        let mut keepalive = self.keepalive.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let close = close_message(CloseCode::Normal, "disposed");
                    best_effort("send close to relay", writer.send(close).await);
                    return SessionEnd::Disposed;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = writer.send(message).await {
                        return SessionEnd::Failed(e.into());
                    }
                }
                _ = tick(keepalive.as_mut()) => {
                    if let Err(e) = writer.send(Message::Ping(Bytes::new())).await {
                        return SessionEnd::Failed(e.into());
                    }
                }
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = self.protocol.handle_message(data) {
                            tracing::warn!(error = %e, "tunnel protocol failed, closing socket");
                            let close = close_message(CloseCode::Error, "protocol error");
                            best_effort("send close to relay", writer.send(close).await);
                            return SessionEnd::HandlerFailed(DisconnectInfo {
                                code: Some(CloseCode::Error.into()),
                                reason: format!("{e:#}"),
                            });
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::warn!(len = text.len(), "ignoring text frame from relay");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Closed(DisconnectInfo::from_close(frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        best_effort("close relay socket", writer.close().await);
                        return SessionEnd::Failed(e.into());
                    }
                    None => return SessionEnd::Closed(DisconnectInfo::abnormal("stream ended")),
                },
            }
        }
    }

    /// Move to `next` unless the handle has been disposed.
    fn transition(&self, next: TunnelState) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Disposed || *state == next {
                return false;
            }
            *state = next;
            true
        });
        !self.cancel.is_cancelled()
    }

    fn callback<'a, T: ?Sized>(&self, cb: &'a Option<Box<T>>) -> Option<&'a T> {
        if self.cancel.is_cancelled() {
            return None;
        }
        cb.as_deref()
    }

    fn disconnected(&self, info: &DisconnectInfo) {
        if let Some(cb) = self.callback(&self.on_disconnect) {
            cb(info);
        }
    }

    /// A transport error: `on_error`, then the close that follows it.
    fn failed(&self, error: TunnelError) {
        if let Some(cb) = self.callback(&self.on_error) {
            cb(&error);
        }
        self.disconnected(&DisconnectInfo::abnormal(error.to_string()));
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Arc<dyn RequestHandler> {
        Arc::new(|_req: ProxyRequest| async move {
            Ok::<_, anyhow::Error>(http::Response::new(Bytes::new()))
        })
    }

    #[test]
    fn endpoint_appends_id_and_maps_scheme() {
        let url = endpoint_url("http://relay.test/devhook", "abc").unwrap();
        assert_eq!(url.as_str(), "ws://relay.test/devhook/abc");

        let url = endpoint_url("https://relay.test/", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://relay.test/abc");

        let url = endpoint_url("ws://127.0.0.1:9000", "x").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/x");
    }

    #[test]
    fn endpoint_escapes_id() {
        let url = endpoint_url("ws://relay.test", "a/b").unwrap();
        assert_eq!(url.path(), "/a%2Fb");
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!(matches!(endpoint_url("ws://relay.test", " "), Err(TunnelError::MissingId)));
        assert!(matches!(
            endpoint_url("ftp://relay.test", "x"),
            Err(TunnelError::InvalidRelayUrl { .. })
        ));
        assert!(matches!(
            endpoint_url("not a url", "x"),
            Err(TunnelError::InvalidRelayUrl { .. })
        ));
    }

    #[test]
    fn close_frame_maps_to_disconnect_info() {
        let info = DisconnectInfo::from_close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        }));
        assert_eq!(info.code, Some(1001));
        assert_eq!(info.reason, "bye");
        assert_eq!(DisconnectInfo::from_close(None).code, None);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        // Nothing listens on port 1; every attempt fails fast.
        let options = TunnelOptions::new("ws://127.0.0.1:1", "id", handler())
            .with_policy(ReconnectPolicy::tunnel_default().without_jitter());
        let handle = listen(options).unwrap();

        handle.dispose();
        handle.dispose();
        assert_eq!(handle.state(), TunnelState::Disposed);
        assert!(handle.is_disposed());

        tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
            .await
            .expect("tunnel task should stop");
        assert_eq!(handle.state(), TunnelState::Disposed);
    }

    #[tokio::test]
    async fn listen_rejects_missing_id() {
        let options = TunnelOptions::new("ws://127.0.0.1:1", "", handler());
        assert!(matches!(listen(options), Err(TunnelError::MissingId)));
    }
}
