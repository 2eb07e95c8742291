//! # Exchange Server Library
//!
//! Host side of the tick-driven message exchange. A single server session
//! listens on a UDP port, keeps a table of live connections and remembers,
//! per connection, the last payload received for every message kind.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Each tick the session:
//! - Updates the driver so socket I/O and connection timers advance
//! - Prunes table entries whose connection is gone
//! - Accepts every connection the driver queued since the previous tick
//! - Drains all pending events of each live connection
//!
//! ### Per-Connection State
//! Every accepted message updates the sender's record in the state store
//! and stamps it with the receipt time. The record is then serialized as
//! JSON and sent straight back, so clients always see their latest state.
//!
//! ### Failure Policy
//! Frames that do not decode are dropped silently and only counted. Send
//! failures are logged and abandoned; nothing is retried.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! The session is driven from one task and owns its store outright. The
//! connection table sits behind a mutex that only the tick and the disposal
//! stack ever take. The driver synchronises internally.
//!
//! ### Unbounded By Default
//! Records are never evicted unless [`state_store::StoreConfig`] enables
//! eviction by age, by count or on disconnect.
//!
//! ## Module Organization
//!
//! ### Connection Table Module (`connection_table`)
//! Growable list of accepted connections with swap-removal pruning.
//!
//! ### State Store Module (`state_store`)
//! Per-connection message history and its JSON snapshot.
//!
//! ### Network Module (`network`)
//! The [`network::ServerSession`] tying driver, table and store together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{ServerConfig, ServerSession};
//! use shared::UdpDriver;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(UdpDriver::default());
//!     let mut server = ServerSession::bind(ServerConfig::default(), driver)?;
//!
//!     let mut ticks = tokio::time::interval(Duration::from_millis(16));
//!     loop {
//!         ticks.tick().await;
//!         server.on_tick(0.016);
//!     }
//! }
//! ```

pub mod connection_table;
pub mod network;
pub mod state_store;
