//! Error types shared by the codec, the transport driver and both sessions

use std::net::SocketAddr;
use thiserror::Error;

/// Failures while turning a message into a frame or back
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The leading segment of a frame does not name a known message kind
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    /// The encoded frame would not fit into a single bounded frame
    #[error("frame of {len} bytes exceeds capacity of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Failures reported by a [`Driver`](crate::transport::Driver)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to parse endpoint {ip}:{port}")]
    EndpointParse { ip: String, port: u16 },

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("driver has no bound socket")]
    NotBound,

    #[error("driver is not listening")]
    NotListening,

    #[error("unknown connection {0}")]
    UnknownConnection(u32),

    #[error("connection {0} is not connected")]
    NotConnected(u32),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
