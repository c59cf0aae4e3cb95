//! Binary framing for multiplexed WebSocket traffic.
//!
//! ## Wire Format
//!
//! Every WebSocket Binary message carries exactly one frame, so frames need
//! no length prefix. All integers are big-endian.
//!
//! ```text
//! +-----------+------+-------+---------------+
//! | stream_id | type | flags | payload ...   |
//! |  4 bytes  |  1   |   1   |  remainder    |
//! +-----------+------+-------+---------------+
//! ```
//!
//! Stream ID parity is meaningful: odd IDs are client-addressable streams,
//! even IDs are server-initiated or broadcast streams.
//!
//! Text frames are not part of the protocol.

pub mod frames;

pub use frames::{FLAG_FIN, Frame, FrameError, FrameType, HEADER_LEN, is_broadcast_id};
