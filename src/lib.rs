//! Stream-multiplexing WebSocket gateway and reconnecting devhook tunnel.
//!
//! - [`protocol`]: the binary frame format both sides speak.
//! - [`gateway`]: many client sockets sharing one backend, with per-client
//!   stream ID translation.
//! - [`tunnel`]: a relay connection that survives network failures and
//!   proxies relay requests to a local handler.

pub mod cleanup;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod tunnel;
