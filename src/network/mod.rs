// network/mod.rs - Network Layer

//! TCP transport for agent messages.
//!
//! This module provides:
//! - `TransportEndpoint` - per-agent listening socket feeding the agent inbox
//! - `Dialer` - outbound links, one pooled connection per peer
//! - `WireFormat` - frame payload encoding (JSON or bincode)
//!
//! Every frame is a 4-byte big-endian length followed by one encoded
//! `AclMessage`.

mod codec;
mod routing;
mod transport;

pub use codec::{frame_codec, CodecError, WireFormat};
pub use routing::Dialer;
pub use transport::{EndpointStatus, TransportConfig, TransportEndpoint};

/// Transport error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Timeout talking to {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Endpoint stopped")]
    Stopped,

    #[error("Delivery aborted")]
    Aborted,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::Codec(err.to_string())
    }
}
