//! # ZRP — Reverse SOCKS5 Proxy
//!
//! A client daemon inside a private network dials out to a publicly
//! reachable server; external users speak SOCKS5 to the server and their
//! traffic is tunneled back through the already-established outbound
//! connection and egressed from the client's network. This inverts the
//! usual SOCKS5 direction so hosts behind NAT can serve external consumers
//! with nothing but outbound connectivity.
//!
//! ## Architecture Overview
//!
//! ```text
//! external user ──SOCKS5──> user channel ──TRANSFER──> data channel ──raw──> real server
//!                               ▲                          ▲
//!            (server process)   │      (client process)    │
//!                               └── control channel ───────┘
//!                          AUTH / CONNECT / DISCONNECT / HEARTBEAT
//! ```
//!
//! Four connection populations share one framed wire protocol:
//!
//! 1. **Control channel** — one long-lived client→server connection per
//!    client, carrying flow setup and heartbeats
//! 2. **User channels** — external SOCKS5 users terminating at the server
//! 3. **Data channels** — short-lived client→server connections, one per
//!    active flow, pooled for reuse
//! 4. **Real-server channels** — client-side connections to the actual
//!    targets inside the private network

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod id;
pub mod idle;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};

/// Maximum frame body accepted on connections the server decodes
/// (the control channel and inbound data channels).
pub const MAX_CONTROL_FRAME: usize = 2 * 1024 * 1024;

/// Maximum frame body accepted on connections the client decodes.
pub const MAX_DATA_FRAME: usize = 1024 * 1024;

/// Socket send/receive buffer size applied where configurable.
pub const SOCKET_BUFFER_SIZE: u32 = 1024 * 1024;

/// Largest payload the relay loops pack into one TRANSFER frame.
pub const TRANSFER_CHUNK: usize = 64 * 1024;
