//! Client session: one connection, polled every tick, with sends that wait
//! for a connection in the background

use log::{debug, error, info, warn};
use shared::{
    decode, encode, parse_endpoint, AtomicConnection, Connection, ConnectionState, DisposeStack,
    Driver, MessageKind, NetworkEvent, Snapshot, TransportError, DEFAULT_IP, DEFAULT_PORT,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Delay between connection state polls while a send waits
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ip: String,
    pub port: u16,
    pub retry_interval: Duration,
    /// Connect attempts a single send may issue; `None` retries forever
    pub max_connect_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_connect_attempts: None,
        }
    }
}

/// Message surfaced to the host after a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub kind: MessageKind,
    pub payload: Option<String>,
}

impl ReceivedMessage {
    /// Parses the payload as the server's per-connection snapshot
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.payload
            .as_deref()
            .and_then(|payload| serde_json::from_str(payload).ok())
    }
}

#[derive(Debug, Default)]
struct ClientCounters {
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    connect_attempts: AtomicU64,
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
}

impl ClientCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub connect_attempts: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
}

/// State reachable from both the tick path and send tasks
///
/// The two sides only meet through the driver and the atomic handle.
struct Shared<D: Driver> {
    driver: Arc<D>,
    connection: AtomicConnection,
    config: ClientConfig,
    counters: ClientCounters,
}

impl<D: Driver> Shared<D> {
    /// Waits until connected, then sends `kind` once
    ///
    /// Every failure ends in a log line and a counter, never an error to the
    /// caller.
    async fn deliver(
        &self,
        kind: MessageKind,
        payload: Option<&str>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let frame = match encode(kind, payload) {
            Ok(frame) => frame,
            Err(e) => {
                ClientCounters::bump(&self.counters.send_failures);
                warn!("Dropping {} message: {}", kind, e);
                return;
            }
        };

        let mut attempts = 0u32;
        loop {
            if *shutdown.borrow() {
                debug!("Session disposed before {} could be sent", kind);
                return;
            }

            let connection = self.connection.load();
            let state = self.driver.connection_state(connection);

            if state == ConnectionState::Connected {
                match self.driver.send(connection, &frame) {
                    Ok(()) => ClientCounters::bump(&self.counters.frames_sent),
                    Err(e) => {
                        ClientCounters::bump(&self.counters.send_failures);
                        warn!("Something went wrong with {} : {}", kind, e);
                    }
                }
                return;
            }

            if state.needs_connect() {
                if let Some(max) = self.config.max_connect_attempts {
                    if attempts >= max {
                        ClientCounters::bump(&self.counters.send_failures);
                        warn!("Giving up on {} after {} connect attempts", kind, attempts);
                        return;
                    }
                }
                attempts += 1;

                match self.try_connect(connection) {
                    Ok(()) => {}
                    Err(e @ TransportError::EndpointParse { .. }) => {
                        error!("{}", e);
                        return;
                    }
                    Err(e) => debug!("Connect attempt failed: {}", e),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Starts a connect and installs the handle if `observed` is still current
    fn try_connect(&self, observed: Connection) -> Result<(), TransportError> {
        let endpoint = parse_endpoint(&self.config.ip, self.config.port)?;

        ClientCounters::bump(&self.counters.connect_attempts);
        let fresh = self.driver.connect(endpoint)?;

        match self.connection.compare_exchange(observed, fresh) {
            Ok(()) => {
                debug!("Connecting to {} as connection {}", endpoint, fresh.id());
                if observed.is_created() {
                    self.driver.disconnect(observed);
                }
            }
            Err(current) => {
                // Another send won the race
                debug!("Connection {} superseded by {}", fresh.id(), current.id());
                self.driver.disconnect(fresh);
            }
        }
        Ok(())
    }
}

/// Client side of the exchange
///
/// `on_tick` must be driven by the host. `send` needs a Tokio runtime: each
/// call spawns a task that polls the connection state every
/// `retry_interval`, connecting whenever the handle is unconnected or
/// dropped, and sends exactly once when connected.
pub struct ClientSession<D: Driver + 'static> {
    shared: Arc<Shared<D>>,
    shutdown_rx: watch::Receiver<bool>,
    subscriber: Option<mpsc::UnboundedSender<ReceivedMessage>>,
    disposables: DisposeStack,
    disposed: bool,
}

impl<D: Driver + 'static> ClientSession<D> {
    pub fn new(config: ClientConfig, driver: Arc<D>) -> Self {
        let mut disposables = DisposeStack::new();

        {
            let driver = Arc::clone(&driver);
            disposables.push("client driver", move || driver.shutdown());
        }

        let shared = Arc::new(Shared {
            driver,
            connection: AtomicConnection::default(),
            config,
            counters: ClientCounters::default(),
        });
        {
            let shared = Arc::clone(&shared);
            disposables.push("client connection", move || {
                let connection = shared.connection.take();
                if connection.is_created() {
                    shared.driver.disconnect(connection);
                }
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        disposables.push("pending sends", move || {
            let _ = shutdown_tx.send(true);
        });

        Self {
            shared,
            shutdown_rx,
            subscriber: None,
            disposables,
            disposed: false,
        }
    }

    /// Returns a channel receiving every message surfaced from now on
    ///
    /// Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReceivedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Pumps the driver and drains events for the current connection
    pub fn on_tick(&mut self, _delta_time: f32) -> Vec<ReceivedMessage> {
        let shared = &self.shared;
        shared.driver.update();

        let connection = shared.connection.load();
        if !connection.is_created() {
            return Vec::new();
        }

        let mut received = Vec::new();
        loop {
            match shared.driver.pop_event(connection) {
                NetworkEvent::Empty => break,
                NetworkEvent::Connect => {
                    info!("Connected to {}:{}", shared.config.ip, shared.config.port)
                }
                NetworkEvent::Data(text) => match decode(&text) {
                    Ok((kind, payload)) => {
                        ClientCounters::bump(&shared.counters.messages_received);
                        received.push(ReceivedMessage { kind, payload });
                    }
                    Err(e) => {
                        ClientCounters::bump(&shared.counters.decode_failures);
                        debug!("Dropping frame from server: {}", e);
                    }
                },
                NetworkEvent::Disconnect => {
                    info!("Disconnected from {}:{}", shared.config.ip, shared.config.port);
                    // A send task may already have installed a fresh handle
                    let _ = shared
                        .connection
                        .compare_exchange(connection, Connection::default());
                    break;
                }
            }
        }

        if let Some(tx) = &self.subscriber {
            let delivered = received.iter().all(|message| tx.send(message.clone()).is_ok());
            if !delivered {
                debug!("Message subscriber dropped");
                self.subscriber = None;
            }
        }

        received
    }

    /// Sends `kind` as soon as the session is connected
    ///
    /// The returned handle may be ignored; the task ends once the frame is
    /// handed to the driver, when it gives up, or when the session is
    /// disposed.
    pub fn send(&self, kind: MessageKind, payload: Option<String>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            shared
                .deliver(kind, payload.as_deref(), &mut shutdown)
                .await;
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .driver
            .connection_state(self.shared.connection.load())
    }

    pub fn connection(&self) -> Connection {
        self.shared.connection.load()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> ClientStats {
        let counters = &self.shared.counters;
        ClientStats {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            send_failures: counters.send_failures.load(Ordering::Relaxed),
            connect_attempts: counters.connect_attempts.load(Ordering::Relaxed),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            decode_failures: counters.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Stops pending sends, drops the connection, then releases the driver
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.subscriber = None;
        self.disposables.dispose();
        info!("Client session disposed");
    }
}

impl<D: Driver + 'static> Drop for ClientSession<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
