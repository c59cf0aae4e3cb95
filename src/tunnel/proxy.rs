//! HTTP over multiplexed frames, the default embedded tunnel protocol.
//!
//! ## Exchange
//!
//! Relay to client, per request stream:
//! - `OPEN` with a JSON [`RequestHead`]; `FIN` set means there is no body.
//! - `DATA` body chunks; `FIN` on the last one.
//! - `CLOSE` or `ERROR` at any point aborts the request.
//!
//! Client to relay, on the same stream:
//! - `OPEN` with a JSON [`ResponseHead`].
//! - `DATA` body chunks of at most [`MAX_CHUNK`] bytes.
//! - `CLOSE` once the body is complete, or a single `ERROR` carrying the
//!   handler's error message instead of all of the above.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::TunnelProtocol;
use super::bridge::{ProxyRequest, ProxyResponse, RequestBody, TunnelBridge};
use crate::cleanup::AbortOnDrop;
use crate::protocol::{FLAG_FIN, Frame, FrameType};

/// Largest DATA payload sent for a response body.
pub const MAX_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    fn into_request(self, body: RequestBody) -> Result<ProxyRequest> {
        let mut builder = http::Request::builder()
            .method(self.method.as_str())
            .uri(self.url.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(body).context("invalid proxied request")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn from_response(response: &ProxyResponse) -> Self {
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
        }
    }
}

/// A request whose handler is still running.
struct InFlight {
    body: Option<mpsc::UnboundedSender<Bytes>>,
    task: AbortOnDrop<()>,
}

pub struct ProxyProtocol {
    bridge: TunnelBridge,
    streams: HashMap<u32, InFlight>,
}

impl std::fmt::Debug for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProtocol")
            .field("in_flight", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl ProxyProtocol {
    pub fn new(bridge: TunnelBridge) -> Self {
        Self {
            bridge,
            streams: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.streams.values().filter(|s| !s.task.is_finished()).count()
    }

    fn open(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        if self.streams.contains_key(&stream_id) {
            tracing::warn!(stream_id, "relay reopened a live stream");
            self.streams.remove(&stream_id);
            self.bridge
                .send(Frame::error(stream_id, "stream already open").encode());
            return;
        }

        let request = serde_json::from_slice::<RequestHead>(&frame.payload)
            .context("invalid request head")
            .and_then(|head| {
                let (tx, body) = RequestBody::channel();
                head.into_request(body).map(|req| (tx, req))
            });
        let (body_tx, request) = match request {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "rejecting proxied request");
                self.bridge
                    .send(Frame::error(stream_id, &format!("{e:#}")).encode());
                return;
            }
        };

        tracing::debug!(
            stream_id,
            method = %request.method(),
            uri = %request.uri(),
            "proxying request"
        );
        let task = tokio::spawn(respond(self.bridge.clone(), stream_id, request));
        let body = if frame.has_flag(FLAG_FIN) {
            None
        } else {
            Some(body_tx)
        };
        self.streams.insert(
            stream_id,
            InFlight {
                body,
                task: AbortOnDrop::new(task),
            },
        );
    }

    fn data(&mut self, frame: Frame) {
        let Some(stream) = self.streams.get_mut(&frame.stream_id) else {
            tracing::trace!(stream_id = frame.stream_id, "data for unknown stream");
            return;
        };
        if let Some(body) = &stream.body {
            // The handler may have stopped reading; that is its business.
            let _ = body.send(frame.payload.clone());
        }
        if frame.has_flag(FLAG_FIN) {
            stream.body = None;
        }
    }
}

impl TunnelProtocol for ProxyProtocol {
    fn handle_message(&mut self, data: Bytes) -> Result<()> {
        let frame = Frame::decode(data).context("undecodable frame from relay")?;
        self.streams.retain(|_, stream| !stream.task.is_finished());

        match frame.frame_type {
            FrameType::Open => self.open(frame),
            FrameType::Data => self.data(frame),
            FrameType::Close | FrameType::Error => {
                if self.streams.remove(&frame.stream_id).is_some() {
                    tracing::debug!(stream_id = frame.stream_id, "relay aborted request");
                }
            }
        }
        Ok(())
    }

    fn on_disconnect(&mut self) {
        if !self.streams.is_empty() {
            tracing::debug!(aborted = self.streams.len(), "dropping in-flight requests");
        }
        self.streams.clear();
    }
}

async fn respond(bridge: TunnelBridge, stream_id: u32, request: ProxyRequest) {
    let outcome = AssertUnwindSafe(bridge.fetch_proxy_request(request))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!(stream_id, error = %e, "request handler failed");
            bridge.send(Frame::error(stream_id, &format!("{e:#}")).encode());
            return;
        }
        Err(_) => {
            tracing::error!(stream_id, "request handler panicked");
            bridge.send(Frame::error(stream_id, "request handler panicked").encode());
            return;
        }
    };

    let head = match serde_json::to_vec(&ResponseHead::from_response(&response)) {
        Ok(head) => head,
        Err(e) => {
            bridge.send(Frame::error(stream_id, &e.to_string()).encode());
            return;
        }
    };
    bridge.send(Frame::open(stream_id, head).encode());

    let body = response.into_body();
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + MAX_CHUNK).min(body.len());
        bridge.send(Frame::data(stream_id, body.slice(offset..end)).encode());
        offset = end;
    }
    bridge.send(Frame::close(stream_id).encode());
}
