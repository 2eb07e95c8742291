//! # Tick Exchange Client Library
//!
//! Client side of the tick-driven message exchange. A [`network::ClientSession`]
//! owns at most one connection to the server and keeps it alive lazily: a
//! send issued while unconnected, or after the transport dropped the
//! connection, starts a new connect and delivers the frame once the
//! connection is up.
//!
//! ## Architecture Overview
//!
//! ### Tick path
//! The host calls [`network::ClientSession::on_tick`] at a fixed rate. Each
//! tick pumps the transport driver and drains the events queued for the
//! current connection. Decodable server frames are returned to the caller and
//! forwarded to an optional subscriber channel; anything else is counted and
//! dropped.
//!
//! ### Send path
//! [`network::ClientSession::send`] encodes the frame up front and spawns a
//! Tokio task that polls the connection state every retry interval. The
//! connection handle lives in an atomic cell, so concurrent sends and the
//! tick path never take a session-wide lock. A send whose connect attempt
//! loses the race to another send simply releases its own connection.
//!
//! ### Teardown
//! Disposal stops pending sends, disconnects the current connection and shuts
//! the driver down, in that order and exactly once.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{ClientConfig, ClientSession};
//! use shared::{MessageKind, UdpDriver};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let mut session = ClientSession::new(ClientConfig::default(), Arc::new(UdpDriver::default()));
//!
//! session.send(MessageKind::Ping, Some("hello".to_string()));
//!
//! loop {
//!     for message in session.on_tick(1.0 / 60.0) {
//!         println!("{} -> {:?}", message.kind, message.snapshot());
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//! }
//! # }
//! ```

pub mod network;
