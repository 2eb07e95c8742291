//! Pieces shared by the server and client sessions: the text frame codec,
//! the transport contract with its UDP driver, error types and ordered
//! teardown.

pub mod codec;
pub mod dispose;
pub mod error;
pub mod transport;
pub mod udp;

pub use codec::{decode, encode, Frame, MessageKind, Snapshot, MAX_FRAME_BYTES, SEPARATOR};
pub use dispose::DisposeStack;
pub use error::{CodecError, TransportError};
pub use transport::{AtomicConnection, Connection, ConnectionState, Driver, NetworkEvent};
pub use udp::{DriverConfig, Packet, UdpDriver};

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7000;

/// Current UTC time in milliseconds since the Unix epoch
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

/// Parses an `(ip, port)` pair into a socket address
pub fn parse_endpoint(ip: &str, port: u16) -> Result<SocketAddr, TransportError> {
    ip.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| TransportError::EndpointParse {
            ip: ip.to_string(),
            port,
        })
}
