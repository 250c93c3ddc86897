//! Error types for the proxy fabric.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the proxy fabric.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A declared frame length exceeded the channel's limit
    #[error("frame too large: {len} bytes (limit {max})")]
    FrameTooLarge {
        /// Declared body length
        len: usize,
        /// Channel limit
        max: usize,
    },

    /// Malformed frame or protocol field
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// URI field longer than the 1-byte length prefix allows
    #[error("uri too long: {0} bytes (limit 255)")]
    UriTooLong(usize),

    /// SOCKS5 negotiation failure
    #[error("socks5 error: {0}")]
    Socks(String),

    /// The peer channel went away mid-operation
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new invalid-frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new SOCKS5 error.
    pub fn socks(msg: impl Into<String>) -> Self {
        Error::Socks(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
