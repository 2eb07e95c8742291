//! UDP implementation of the [`Driver`] contract
//!
//! Connection management sits on top of plain datagrams. Each datagram is a
//! bincode-encoded [`Packet`]; peers are identified by their socket address.
//! Connection requests carry a random token so a retransmitted request is
//! idempotent while a fresh request from the same address replaces the
//! stale peer.

use crate::codec::Frame;
use crate::error::TransportError;
use crate::transport::{Connection, ConnectionState, Driver, NetworkEvent};
use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Large enough for a full frame plus the envelope
pub const RECV_BUFFER_BYTES: usize = 8192;

/// Datagram envelope exchanged between drivers
///
/// The token picked by the connecting side names the connection on both
/// ends, so several connections from one address never collide.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest { token: u32 },
    ConnectionAccepted { token: u32 },
    Data { token: u32, frame: String },
    Heartbeat { token: u32 },
    Disconnect { token: u32 },
}

impl Packet {
    pub fn token(&self) -> u32 {
        match self {
            Packet::ConnectionRequest { token }
            | Packet::ConnectionAccepted { token }
            | Packet::Data { token, .. }
            | Packet::Heartbeat { token }
            | Packet::Disconnect { token } => *token,
        }
    }
}

/// Timers governing the connection handshake and liveness
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Delay between connection request retransmissions
    pub connect_timeout: Duration,
    /// Requests sent before a connecting peer is given up
    pub max_connect_attempts: u32,
    /// Silence after which a connected peer is dropped
    pub disconnect_timeout: Duration,
    /// Keepalive cadence for otherwise idle connections
    pub heartbeat_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            max_connect_attempts: 60,
            disconnect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    token: u32,
    state: ConnectionState,
    events: VecDeque<NetworkEvent>,
    last_received: Instant,
    last_sent: Instant,
    connect_attempts: u32,
}

impl Peer {
    fn new(addr: SocketAddr, token: u32, state: ConnectionState, now: Instant) -> Self {
        Self {
            addr,
            token,
            state,
            events: VecDeque::new(),
            last_received: now,
            last_sent: now,
            connect_attempts: 0,
        }
    }

    fn is_live(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    fn drop_connection(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.events.push_back(NetworkEvent::Disconnect);
    }
}

#[derive(Debug, Default)]
struct Inner {
    socket: Option<UdpSocket>,
    listening: bool,
    peers: HashMap<u32, Peer>,
    accept_queue: VecDeque<Connection>,
    next_id: u32,
}

impl Inner {
    /// Next free id; 0 stays reserved for the unconnected handle
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.peers.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn find_live_peer(&self, addr: SocketAddr, token: u32) -> Option<u32> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.addr == addr && peer.token == token && peer.is_live())
            .map(|(id, _)| *id)
    }

    fn ensure_socket(&mut self, target: SocketAddr) -> Result<&UdpSocket, TransportError> {
        if self.socket.is_none() {
            let local: SocketAddr = if target.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket =
                UdpSocket::bind(local).map_err(|source| TransportError::Bind { addr: local, source })?;
            socket.set_nonblocking(true)?;
            self.socket = Some(socket);
        }
        self.socket.as_ref().ok_or(TransportError::NotBound)
    }

    fn receive_all(&mut self, now: Instant, outbox: &mut Vec<(Packet, SocketAddr)>) {
        let mut received = Vec::new();
        if let Some(socket) = &self.socket {
            let mut buffer = [0u8; RECV_BUFFER_BYTES];
            loop {
                match socket.recv_from(&mut buffer) {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => received.push((packet, addr)),
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    // ICMP errors surface here on some platforms; the datagram is gone either way
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        warn!("Error receiving packet: {}", e);
                        break;
                    }
                }
            }
        }

        for (packet, addr) in received {
            self.handle_packet(packet, addr, now, outbox);
        }
    }

    fn handle_packet(
        &mut self,
        packet: Packet,
        addr: SocketAddr,
        now: Instant,
        outbox: &mut Vec<(Packet, SocketAddr)>,
    ) {
        let existing = self.find_live_peer(addr, packet.token());

        match packet {
            Packet::ConnectionRequest { token } => {
                if !self.listening {
                    debug!("Ignoring connection request from {} while not listening", addr);
                    return;
                }

                if let Some(peer) = existing.and_then(|id| self.peers.get_mut(&id)) {
                    // Retransmitted request, the accept was probably lost
                    peer.last_received = now;
                    outbox.push((Packet::ConnectionAccepted { token }, addr));
                    return;
                }

                let id = self.allocate_id();
                let mut peer = Peer::new(addr, token, ConnectionState::Connected, now);
                peer.events.push_back(NetworkEvent::Connect);
                self.peers.insert(id, peer);
                self.accept_queue.push_back(Connection::new(id));
                info!("Accepted connection {} from {}", id, addr);
                outbox.push((Packet::ConnectionAccepted { token }, addr));
            }

            Packet::ConnectionAccepted { .. } => {
                let Some(peer) = existing.and_then(|id| self.peers.get_mut(&id)) else {
                    debug!("Unexpected or stale accept from {}", addr);
                    return;
                };
                peer.last_received = now;
                if peer.state == ConnectionState::Connecting {
                    peer.state = ConnectionState::Connected;
                    peer.events.push_back(NetworkEvent::Connect);
                    info!("Connected to {}", addr);
                }
            }

            Packet::Data { frame, .. } => match existing.and_then(|id| self.peers.get_mut(&id)) {
                Some(peer) if peer.state == ConnectionState::Connected => {
                    peer.last_received = now;
                    peer.events.push_back(NetworkEvent::Data(frame));
                }
                _ => debug!("Dropping data from unconnected peer {}", addr),
            },

            Packet::Heartbeat { .. } => {
                if let Some(peer) = existing.and_then(|id| self.peers.get_mut(&id)) {
                    peer.last_received = now;
                }
            }

            Packet::Disconnect { .. } => match existing {
                Some(id) => {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        info!("Connection {} closed by {}", id, addr);
                        peer.drop_connection();
                    }
                }
                None => debug!("Ignoring disconnect for unknown connection from {}", addr),
            },
        }
    }

    fn advance_timers(
        &mut self,
        now: Instant,
        config: &DriverConfig,
        outbox: &mut Vec<(Packet, SocketAddr)>,
    ) {
        let mut finished = Vec::new();

        for (id, peer) in self.peers.iter_mut() {
            match peer.state {
                ConnectionState::Connecting => {
                    if now.duration_since(peer.last_sent) < config.connect_timeout {
                        continue;
                    }
                    if peer.connect_attempts >= config.max_connect_attempts {
                        warn!(
                            "Giving up on {} after {} connection attempts",
                            peer.addr, peer.connect_attempts
                        );
                        peer.drop_connection();
                    } else {
                        peer.connect_attempts += 1;
                        peer.last_sent = now;
                        outbox.push((Packet::ConnectionRequest { token: peer.token }, peer.addr));
                    }
                }
                ConnectionState::Connected => {
                    if now.duration_since(peer.last_received) > config.disconnect_timeout {
                        info!("Connection {} to {} timed out", id, peer.addr);
                        peer.drop_connection();
                    } else if now.duration_since(peer.last_sent) >= config.heartbeat_interval {
                        peer.last_sent = now;
                        outbox.push((Packet::Heartbeat { token: peer.token }, peer.addr));
                    }
                }
                ConnectionState::Disconnected if peer.events.is_empty() => finished.push(*id),
                _ => {}
            }
        }

        for id in finished {
            self.peers.remove(&id);
        }
    }

    fn flush(&self, outbox: Vec<(Packet, SocketAddr)>) {
        let Some(socket) = &self.socket else {
            return;
        };
        for (packet, addr) in outbox {
            if let Err(e) = send_packet(socket, &packet, addr) {
                warn!("Failed to send {:?} to {}: {}", packet, addr, e);
            }
        }
    }
}

fn send_packet(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> Result<(), TransportError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).map_err(TransportError::Send)?;
    Ok(())
}

/// Driver over a non-blocking UDP socket
///
/// A driver that never binds explicitly binds an ephemeral port on its first
/// `connect`.
#[derive(Debug, Default)]
pub struct UdpDriver {
    config: DriverConfig,
    inner: Mutex<Inner>,
}

impl UdpDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind, keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Driver for UdpDriver {
    fn bind(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        self.lock().socket = Some(socket);
        Ok(())
    }

    fn listen(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.socket.is_none() {
            return Err(TransportError::NotBound);
        }
        inner.listening = true;
        Ok(())
    }

    fn update(&self) {
        let now = Instant::now();
        let mut outbox = Vec::new();
        let mut inner = self.lock();
        inner.receive_all(now, &mut outbox);
        inner.advance_timers(now, &self.config, &mut outbox);
        inner.flush(outbox);
    }

    fn accept(&self) -> Option<Connection> {
        let mut inner = self.lock();
        if !inner.listening {
            return None;
        }
        inner.accept_queue.pop_front()
    }

    fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let mut inner = self.lock();
        let token = rand::random::<u32>();
        let socket = inner.ensure_socket(addr)?;
        if let Err(e) = send_packet(socket, &Packet::ConnectionRequest { token }, addr) {
            // Retransmitted on the next connect timeout
            warn!("Initial connection request to {} failed: {}", addr, e);
        }

        let id = inner.allocate_id();
        let mut peer = Peer::new(addr, token, ConnectionState::Connecting, Instant::now());
        peer.connect_attempts = 1;
        inner.peers.insert(id, peer);
        debug!("Connecting to {} as connection {}", addr, id);
        Ok(Connection::new(id))
    }

    fn pop_event(&self, connection: Connection) -> NetworkEvent {
        self.lock()
            .peers
            .get_mut(&connection.id())
            .and_then(|peer| peer.events.pop_front())
            .unwrap_or(NetworkEvent::Empty)
    }

    fn send(&self, connection: Connection, frame: &Frame) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let Inner { socket, peers, .. } = &mut *inner;
        let peer = peers
            .get_mut(&connection.id())
            .ok_or(TransportError::UnknownConnection(connection.id()))?;
        if peer.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(connection.id()));
        }
        let socket = socket.as_ref().ok_or(TransportError::NotBound)?;

        let packet = Packet::Data {
            token: peer.token,
            frame: frame.as_str().to_string(),
        };
        send_packet(socket, &packet, peer.addr)?;
        peer.last_sent = Instant::now();
        Ok(())
    }

    fn connection_state(&self, connection: Connection) -> ConnectionState {
        if !connection.is_created() {
            return ConnectionState::Unconnected;
        }
        self.lock()
            .peers
            .get(&connection.id())
            .map(|peer| peer.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn disconnect(&self, connection: Connection) {
        let mut inner = self.lock();
        let Some(peer) = inner.peers.remove(&connection.id()) else {
            return;
        };
        if peer.is_live() {
            if let Some(socket) = &inner.socket {
                let packet = Packet::Disconnect { token: peer.token };
                if let Err(e) = send_packet(socket, &packet, peer.addr) {
                    debug!("Failed to notify {} of disconnect: {}", peer.addr, e);
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        let outbox: Vec<_> = inner
            .peers
            .values()
            .filter(|peer| peer.is_live())
            .map(|peer| (Packet::Disconnect { token: peer.token }, peer.addr))
            .collect();
        inner.flush(outbox);

        inner.peers.clear();
        inner.accept_queue.clear();
        inner.listening = false;
        inner.socket = None;
    }
}
