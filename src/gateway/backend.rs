//! The shared compute backend behind the gateway.
//!
//! A backend is a black box that accepts encoded frames and, eventually,
//! emits encoded frames through the `BackendSender` it was built with. Every
//! response echoes a stream ID it was given, or uses an even ID for
//! server-initiated traffic.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{Frame, FrameType};

/// Callback handed to a backend for emitting frames.
#[derive(Debug, Clone)]
pub struct BackendSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl BackendSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue an encoded frame for routing back to clients.
    ///
    /// Frames sent after the gateway has shut down are discarded.
    pub fn send(&self, data: Bytes) {
        if self.tx.send(data).is_err() {
            tracing::debug!("backend frame discarded, gateway is gone");
        }
    }
}

pub trait Backend: Send + Sync + 'static {
    /// Deliver one encoded frame. Must not block.
    fn handle_message(&self, data: Bytes);
}

/// Payload that makes `EchoBackend` emit a broadcast frame.
pub const BROADCAST_REQUEST: &[u8] = b"broadcast";

/// Stream ID used by `EchoBackend` for broadcast frames.
pub const ECHO_BROADCAST_ID: u32 = 2;

/// Reference backend: echoes OPEN and DATA payloads on the same stream and
/// answers CLOSE with CLOSE.
///
/// A DATA frame whose payload is exactly `b"broadcast"` additionally emits
/// a DATA frame on the even stream 2, which the gateway fans out to every
/// client.
#[derive(Debug)]
pub struct EchoBackend {
    sender: BackendSender,
}

impl EchoBackend {
    pub fn new(sender: BackendSender) -> Self {
        Self { sender }
    }
}

impl Backend for EchoBackend {
    fn handle_message(&self, data: Bytes) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "echo backend got malformed frame");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Open | FrameType::Data => {
                if frame.payload.as_ref() == BROADCAST_REQUEST {
                    self.sender
                        .send(Frame::data(ECHO_BROADCAST_ID, frame.payload.clone()).encode());
                }
                self.sender.send(frame.encode());
            }
            FrameType::Close => self.sender.send(Frame::close(frame.stream_id).encode()),
            FrameType::Error => {
                tracing::debug!(
                    stream_id = frame.stream_id,
                    message = %frame.payload_text(),
                    "client aborted stream"
                );
            }
        }
    }
}
