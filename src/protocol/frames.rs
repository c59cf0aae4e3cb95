//! Frame types and the binary codec shared by the gateway and the tunnel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// The sender will not send more payload on this stream.
pub const FLAG_FIN: u8 = 0x01;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream. The payload carries stream-specific metadata.
    Open = 0x01,
    /// Payload bytes for an open stream.
    Data = 0x02,
    /// Orderly end of a stream.
    Close = 0x03,
    /// Abnormal end of a stream. The payload is a UTF-8 message.
    Error = 0x04,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            0x04 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes, header needs {HEADER_LEN}")]
    Truncated { len: usize },
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
}

/// Returns true for IDs in the server-initiated / broadcast class.
pub fn is_broadcast_id(stream_id: u32) -> bool {
    stream_id % 2 == 0
}

/// One unit of the multiplexing protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: 0,
            payload: payload.into(),
        }
    }

    pub fn open(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(stream_id, FrameType::Open, payload)
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn error(stream_id: u32, message: &str) -> Self {
        Self::new(
            stream_id,
            FrameType::Error,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// CLOSE and ERROR end a stream and free its mapping.
    pub fn is_terminal(&self) -> bool {
        matches!(self.frame_type, FrameType::Close | FrameType::Error)
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// The buffer is reference counted; it is released when the last owner
    /// (normally the socket writer, after the send completes) drops it.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u8(self.flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame. The payload shares the input allocation.
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated { len: data.len() });
        }
        let stream_id = data.get_u32();
        let raw_type = data.get_u8();
        let flags = data.get_u8();
        let frame_type = FrameType::from_u8(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload: data,
        })
    }

    /// Lossy UTF-8 view of the payload, used for ERROR messages.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let frame = Frame::data(0x0102_0304, &b"hi"[..]).with_flags(FLAG_FIN);
        let bytes = frame.encode();
        assert_eq!(&bytes[..], &[0x01, 0x02, 0x03, 0x04, 0x02, 0x01, b'h', b'i']);
    }

    #[test]
    fn test_decode_encoded_close() {
        let bytes = Frame::close(7).encode();
        let decoded = Frame::decode(bytes).expect("decode should succeed");
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.frame_type, FrameType::Close);
        assert!(decoded.payload.is_empty());
        assert!(decoded.is_terminal());
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0, 1, 2])).unwrap_err();
        assert_eq!(err, FrameError::Truncated { len: 5 });
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0, 1, 0x7f, 0])).unwrap_err();
        assert_eq!(err, FrameError::UnknownType(0x7f));
    }

    #[test]
    fn test_header_only_frame_has_empty_payload() {
        let decoded = Frame::decode(Bytes::from_static(&[0, 0, 0, 2, 0x02, 0])).unwrap();
        assert!(decoded.payload.is_empty());
        assert!(is_broadcast_id(decoded.stream_id));
    }

    #[test]
    fn test_error_frame_carries_message() {
        let frame = Frame::decode(Frame::error(3, "boom").encode()).unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.payload_text(), "boom");
        assert!(frame.is_terminal());
    }

    #[test]
    fn test_parity_classes() {
        assert!(!is_broadcast_id(1));
        assert!(!is_broadcast_id(u32::MAX));
        assert!(is_broadcast_id(0));
        assert!(is_broadcast_id(2));
    }
}
