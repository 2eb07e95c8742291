//! Server session driving the listening driver once per tick

use crate::connection_table::ConnectionTable;
use crate::state_store::{StateStore, StoreConfig};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, timestamp_millis, Connection, ConnectionState, DisposeStack, Driver,
    MessageKind, NetworkEvent, TransportError, DEFAULT_PORT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port bound on every IPv4 interface
    pub port: u16,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            store: StoreConfig::default(),
        }
    }
}

/// Counters kept across ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub ticks: u64,
    pub connections_accepted: u64,
    pub connections_pruned: u64,
    pub frames_received: u64,
    pub decode_failures: u64,
    pub reserved_rejected: u64,
    pub responses_sent: u64,
    pub send_failures: u64,
    pub records_evicted: u64,
}

/// Host side of the exchange
///
/// Owns the connection table and the state store for its whole lifetime.
/// Every tick it prunes dead connections, accepts new ones and drains their
/// inbound frames, answering each accepted message with the sender's
/// current snapshot.
pub struct ServerSession<D: Driver + 'static> {
    driver: Arc<D>,
    /// Shared only with the release action that drains it on dispose
    connections: Arc<Mutex<ConnectionTable>>,
    store: StateStore,
    stats: ServerStats,
    disposables: DisposeStack,
    disposed: bool,
}

impl<D: Driver + 'static> ServerSession<D> {
    /// Binds `0.0.0.0:port` and starts listening
    ///
    /// A bind failure is fatal to startup and is not retried.
    pub fn bind(config: ServerConfig, driver: Arc<D>) -> Result<Self, TransportError> {
        let mut disposables = DisposeStack::new();

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        if let Err(e) = driver.bind(addr) {
            error!("Failed to bind to {}: {}", addr, e);
            return Err(e);
        }
        {
            let driver = Arc::clone(&driver);
            disposables.push("server driver", move || driver.shutdown());
        }
        driver.listen()?;

        let connections = Arc::new(Mutex::new(ConnectionTable::new()));
        {
            let driver = Arc::clone(&driver);
            let connections = Arc::clone(&connections);
            disposables.push("server connections", move || {
                for connection in lock_table(&connections).drain() {
                    if connection.is_created() {
                        driver.disconnect(connection);
                    }
                }
            });
        }

        info!(
            "Server listening on {}",
            driver.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            driver,
            connections,
            store: StateStore::new(config.store),
            stats: ServerStats::default(),
            disposables,
            disposed: false,
        })
    }

    /// Runs one tick: prune, accept, then drain every live connection
    pub fn on_tick(&mut self, _delta_time: f32) {
        self.stats.ticks += 1;
        self.driver.update();

        let driver = Arc::clone(&self.driver);
        let connections = Arc::clone(&self.connections);
        let mut table = lock_table(&connections);

        let pruned = table.prune(|connection| {
            connection.is_created()
                && driver.connection_state(*connection) != ConnectionState::Disconnected
        });
        self.stats.connections_pruned += pruned.len() as u64;
        for connection in pruned.into_iter().filter(Connection::is_created) {
            self.on_disconnected(connection);
        }

        let accepted = table.accept_pending(|| driver.accept());
        if accepted > 0 {
            debug!("Accepted {} new connections", accepted);
            self.stats.connections_accepted += accepted as u64;
        }

        for index in 0..table.len() {
            let Some(connection) = table.get(index) else {
                continue;
            };
            if !connection.is_created() {
                continue;
            }

            loop {
                match self.driver.pop_event(connection) {
                    NetworkEvent::Empty => break,
                    NetworkEvent::Connect => debug!("Connection {} established", connection.id()),
                    NetworkEvent::Data(text) => self.handle_frame(connection, &text),
                    NetworkEvent::Disconnect => {
                        info!("Connection {} disconnected", connection.id());
                        table.mark_dead(index);
                        self.on_disconnected(connection);
                        break;
                    }
                }
            }
        }

        let evicted = self.store.evict_stale(timestamp_millis());
        self.stats.records_evicted += evicted.len() as u64;
    }

    fn on_disconnected(&mut self, connection: Connection) {
        if self.store.on_disconnect(connection.id()) {
            self.stats.records_evicted += 1;
        }
    }

    /// Decodes one inbound frame and answers it
    ///
    /// Frames that fail to decode are dropped without a response, as are
    /// frames claiming a reserved kind.
    fn handle_frame(&mut self, connection: Connection, text: &str) {
        self.stats.frames_received += 1;

        let (kind, payload) = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.stats.decode_failures += 1;
                debug!("Dropping frame from connection {}: {}", connection.id(), e);
                return;
            }
        };

        if kind.is_reserved() {
            self.stats.reserved_rejected += 1;
            debug!(
                "Dropping reserved kind {} from connection {}",
                kind,
                connection.id()
            );
            return;
        }

        self.store.update(connection.id(), kind, payload);
        self.respond(connection, kind);
    }

    /// Sends the connection's snapshot back as `KIND_<json>`, once
    fn respond(&mut self, connection: Connection, kind: MessageKind) {
        let body = match self.store.serialize(connection.id()) {
            Ok(body) => body,
            Err(e) => {
                self.stats.send_failures += 1;
                warn!("Failed to serialize state for {}: {}", kind, e);
                return;
            }
        };

        let result = encode(kind, Some(&body))
            .map_err(|e| e.to_string())
            .and_then(|frame| {
                self.driver
                    .send(connection, &frame)
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(()) => self.stats.responses_sent += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                warn!("Something went wrong with {} : {}", kind, e);
            }
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Copy of the table's live handles
    pub fn connections(&self) -> Vec<Connection> {
        lock_table(&self.connections)
            .iter()
            .copied()
            .filter(Connection::is_created)
            .collect()
    }

    /// Number of table entries holding a created handle
    pub fn connection_count(&self) -> usize {
        lock_table(&self.connections)
            .iter()
            .filter(|c| c.is_created())
            .count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.driver.local_addr()
    }

    /// Releases connections, then the driver
    ///
    /// Runs once; later calls and the eventual drop do nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.disposables.dispose();
        info!("Server session disposed");
    }
}

fn lock_table(table: &Mutex<ConnectionTable>) -> MutexGuard<'_, ConnectionTable> {
    // The table stays consistent between calls, so a poisoned lock is usable
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<D: Driver + 'static> Drop for ServerSession<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Snapshot, UdpDriver, MAX_FRAME_BYTES};
    use std::thread;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn start_server(store: StoreConfig) -> ServerSession<UdpDriver> {
        let config = ServerConfig { port: 0, store };
        ServerSession::bind(config, Arc::new(UdpDriver::default())).unwrap()
    }

    fn loopback_addr(server: &ServerSession<UdpDriver>) -> SocketAddr {
        let port = server.local_addr().unwrap().port();
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    /// Ticks the server and updates the peer until `done` holds
    fn pump(
        server: &mut ServerSession<UdpDriver>,
        peer: &UdpDriver,
        mut done: impl FnMut(&ServerSession<UdpDriver>) -> bool,
    ) -> bool {
        for _ in 0..200 {
            server.on_tick(0.016);
            peer.update();
            if done(server) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn connect_peer(server: &mut ServerSession<UdpDriver>) -> (UdpDriver, Connection) {
        let peer = UdpDriver::default();
        let conn = peer.connect(loopback_addr(server)).unwrap();
        assert!(pump(server, &peer, |_| {
            peer.connection_state(conn) == ConnectionState::Connected
        }));
        (peer, conn)
    }

    fn next_data(server: &mut ServerSession<UdpDriver>, peer: &UdpDriver, conn: Connection) -> Option<String> {
        let mut received = None;
        pump(server, peer, |_| {
            loop {
                match peer.pop_event(conn) {
                    NetworkEvent::Data(text) => {
                        received = Some(text);
                        return true;
                    }
                    NetworkEvent::Empty => return false,
                    _ => continue,
                }
            }
        });
        received
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7000);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let first = start_server(StoreConfig::default());
        let port = first.local_addr().unwrap().port();

        let config = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        let result = ServerSession::bind(config, Arc::new(UdpDriver::default()));
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }

    #[test]
    fn test_accepts_connection() {
        let mut server = start_server(StoreConfig::default());
        let (_peer, _conn) = connect_peer(&mut server);

        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.stats().connections_accepted, 1);
        assert!(server.store().is_empty());
    }

    #[test]
    fn test_ping_updates_store_and_responds() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        let frame = encode(MessageKind::Ping, None).unwrap();
        assert_ok!(peer.send(conn, &frame));

        let response = next_data(&mut server, &peer, conn).expect("no response");
        let (kind, payload) = decode(&response).unwrap();
        assert_eq!(kind, MessageKind::Ping);

        let snapshot: Snapshot = serde_json::from_str(&payload.unwrap()).unwrap();
        assert_eq!(snapshot.get(&MessageKind::Ping), Some(&None));
        assert!(snapshot.contains_key(&MessageKind::LastUpdateTime));

        assert_eq!(server.store().len(), 1);
        assert_eq!(server.stats().frames_received, 1);
        assert_eq!(server.stats().responses_sent, 1);
    }

    #[test]
    fn test_response_carries_latest_payload() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        for payload in ["one", "two_with_separator"] {
            let frame = encode(MessageKind::Ping, Some(payload)).unwrap();
            assert_ok!(peer.send(conn, &frame));
            let response = next_data(&mut server, &peer, conn).expect("no response");
            let (_, body) = decode(&response).unwrap();
            let snapshot: Snapshot = serde_json::from_str(&body.unwrap()).unwrap();
            assert_eq!(
                snapshot.get(&MessageKind::Ping),
                Some(&Some(payload.to_string()))
            );
        }
    }

    #[test]
    fn test_malformed_frame_is_ignored() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        // Frame::new only checks size, so an unknown tag gets through
        let frame = shared::Frame::new("Pong_data".to_string()).unwrap();
        assert_ok!(peer.send(conn, &frame));

        assert!(pump(&mut server, &peer, |s| s.stats().decode_failures == 1));
        assert!(server.store().is_empty());
        assert_eq!(server.stats().responses_sent, 0);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(peer.connection_state(conn), ConnectionState::Connected);
    }

    #[test]
    fn test_reserved_kind_is_rejected() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        let frame = encode(MessageKind::LastUpdateTime, Some("0")).unwrap();
        assert_ok!(peer.send(conn, &frame));

        assert!(pump(&mut server, &peer, |s| s.stats().reserved_rejected == 1));
        assert!(server.store().is_empty());
        assert_eq!(server.stats().responses_sent, 0);
    }

    #[test]
    fn test_oversize_response_is_dropped() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        // Fits in a frame, but the JSON snapshot around it does not
        let payload = "x".repeat(MAX_FRAME_BYTES - 10);
        let frame = encode(MessageKind::Ping, Some(&payload)).unwrap();
        assert_ok!(peer.send(conn, &frame));

        assert!(pump(&mut server, &peer, |s| s.stats().send_failures == 1));
        assert_eq!(server.store().len(), 1);
        assert_eq!(server.stats().responses_sent, 0);
    }

    #[test]
    fn test_disconnect_prunes_connection() {
        let mut server = start_server(StoreConfig::default());
        let (peer, conn) = connect_peer(&mut server);

        assert_ok!(peer.send(conn, &encode(MessageKind::Ping, None).unwrap()));
        assert!(pump(&mut server, &peer, |s| s.store().len() == 1));

        peer.disconnect(conn);
        assert!(pump(&mut server, &peer, |s| s.connections().is_empty()));

        // Records are kept after disconnect unless configured otherwise
        assert_eq!(server.store().len(), 1);
    }

    #[test]
    fn test_evict_on_disconnect() {
        let mut server = start_server(StoreConfig {
            evict_on_disconnect: true,
            ..StoreConfig::default()
        });
        let (peer, conn) = connect_peer(&mut server);

        assert_ok!(peer.send(conn, &encode(MessageKind::Ping, None).unwrap()));
        assert!(pump(&mut server, &peer, |s| s.store().len() == 1));

        peer.disconnect(conn);
        assert!(pump(&mut server, &peer, |s| s.store().is_empty()));
        assert_eq!(server.stats().records_evicted, 1);
    }

    #[test]
    fn test_separate_records_per_connection() {
        let mut server = start_server(StoreConfig::default());
        let (peer_a, conn_a) = connect_peer(&mut server);
        let (peer_b, conn_b) = connect_peer(&mut server);
        assert_eq!(server.connection_count(), 2);

        assert_ok!(peer_a.send(conn_a, &encode(MessageKind::Ping, Some("a")).unwrap()));
        assert_ok!(peer_b.send(conn_b, &encode(MessageKind::Ping, Some("b")).unwrap()));

        assert!(pump(&mut server, &peer_a, |s| s.store().len() == 2));

        let all: std::collections::BTreeMap<u32, Snapshot> =
            serde_json::from_str(&server.store().serialize_all().unwrap()).unwrap();
        let payloads: Vec<_> = all
            .values()
            .map(|s| s.get(&MessageKind::Ping).cloned().flatten())
            .collect();
        assert_eq!(payloads, vec![Some("a".to_string()), Some("b".to_string())]);
    }

    #[test]
    fn test_dispose_releases_driver() {
        let driver = Arc::new(UdpDriver::default());
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let mut server = ServerSession::bind(config, Arc::clone(&driver)).unwrap();
        assert!(driver.local_addr().is_some());

        server.dispose();
        assert!(driver.local_addr().is_none());
        assert!(server.connections().is_empty());

        // Second dispose and the drop are no-ops
        server.dispose();
        drop(server);
    }

    /// Delegates to a UDP driver and records teardown calls
    #[derive(Default)]
    struct RecordingDriver {
        inner: UdpDriver,
        released: std::sync::Mutex<Vec<String>>,
    }

    impl Driver for RecordingDriver {
        fn bind(&self, addr: SocketAddr) -> Result<(), TransportError> {
            self.inner.bind(addr)
        }

        fn listen(&self) -> Result<(), TransportError> {
            self.inner.listen()
        }

        fn update(&self) {
            self.inner.update()
        }

        fn accept(&self) -> Option<Connection> {
            self.inner.accept()
        }

        fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
            self.inner.connect(addr)
        }

        fn pop_event(&self, connection: Connection) -> NetworkEvent {
            self.inner.pop_event(connection)
        }

        fn send(&self, connection: Connection, frame: &shared::Frame) -> Result<(), TransportError> {
            self.inner.send(connection, frame)
        }

        fn connection_state(&self, connection: Connection) -> ConnectionState {
            self.inner.connection_state(connection)
        }

        fn disconnect(&self, connection: Connection) {
            self.released
                .lock()
                .unwrap()
                .push(format!("disconnect {}", connection.id()));
            self.inner.disconnect(connection)
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            self.inner.local_addr()
        }

        fn shutdown(&self) {
            self.released.lock().unwrap().push("shutdown".to_string());
            self.inner.shutdown()
        }
    }

    #[test]
    fn test_dispose_releases_connections_before_driver() {
        let driver = Arc::new(RecordingDriver::default());
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let mut server = ServerSession::bind(config, Arc::clone(&driver)).unwrap();
        let port = server.local_addr().unwrap().port();

        let peer = UdpDriver::default();
        let conn = peer
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .unwrap();
        let mut accepted = Vec::new();
        for _ in 0..200 {
            server.on_tick(0.016);
            peer.update();
            accepted = server.connections();
            if !accepted.is_empty() && peer.connection_state(conn) == ConnectionState::Connected {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(accepted.len(), 1);

        server.dispose();
        server.dispose();

        assert_eq!(
            *driver.released.lock().unwrap(),
            vec![format!("disconnect {}", accepted[0].id()), "shutdown".to_string()]
        );
        assert!(server.connections().is_empty());

        // The peer hears about it
        let mut closed = false;
        for _ in 0..200 {
            peer.update();
            if peer.connection_state(conn) == ConnectionState::Disconnected {
                closed = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(closed);
    }
}
