//! Transport contract consumed by both sessions
//!
//! A [`Driver`] owns a socket and every connection made through it. Sessions
//! only ever hold [`Connection`] handles and ask the driver about them. The
//! driver does its own synchronisation, so a session may share it between
//! the tick path and background send tasks.

use crate::codec::Frame;
use crate::error::TransportError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Handle to a connection owned by a driver
///
/// Identity `0` is the default, unconnected handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection {
    id: u32,
}

impl Connection {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns false for the default handle
    pub fn is_created(&self) -> bool {
        self.id != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reported for the default handle
    Unconnected,
    Connecting,
    Connected,
    /// Reported for any handle the driver has dropped or never knew
    Disconnected,
}

impl ConnectionState {
    /// True when a new connect attempt should be issued
    pub fn needs_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Unconnected | ConnectionState::Disconnected
        )
    }
}

/// One event popped for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Empty,
    Connect,
    Data(String),
    Disconnect,
}

/// Poll-based datagram driver
///
/// `update` must run once per tick before any events are popped; it is a
/// bounded synchronisation point that flushes socket I/O and advances
/// connection timers.
pub trait Driver: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> Result<(), TransportError>;

    fn listen(&self) -> Result<(), TransportError>;

    fn update(&self);

    /// Pops the next newly accepted connection, if any
    fn accept(&self) -> Option<Connection>;

    /// Starts a non-blocking connect; the handle reports `Connecting` until
    /// the peer answers
    fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError>;

    fn pop_event(&self, connection: Connection) -> NetworkEvent;

    fn send(&self, connection: Connection, frame: &Frame) -> Result<(), TransportError>;

    fn connection_state(&self, connection: Connection) -> ConnectionState;

    fn disconnect(&self, connection: Connection);

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Disconnects every connection and releases the socket
    fn shutdown(&self);
}

/// Connection handle that can be swapped without a lock
///
/// Shared between a session's tick path and its in-flight send tasks.
#[derive(Debug, Default)]
pub struct AtomicConnection {
    id: AtomicU32,
}

impl AtomicConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            id: AtomicU32::new(connection.id()),
        }
    }

    pub fn load(&self) -> Connection {
        Connection::new(self.id.load(Ordering::Acquire))
    }

    pub fn store(&self, connection: Connection) {
        self.id.store(connection.id(), Ordering::Release);
    }

    /// Replaces `current` with `new`, returning the handle actually seen on
    /// failure
    pub fn compare_exchange(&self, current: Connection, new: Connection) -> Result<(), Connection> {
        self.id
            .compare_exchange(current.id(), new.id(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Connection::new)
    }

    pub fn take(&self) -> Connection {
        Connection::new(self.id.swap(0, Ordering::AcqRel))
    }
}
