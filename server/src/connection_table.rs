//! Live connection tracking for the server session
//!
//! This module keeps the server-side list of accepted connections:
//! - Appending every connection the driver accepted since the last tick
//! - Compacting dead entries with swap-removal
//! - Marking entries dead when their connection reports a disconnect
//!
//! Order is not preserved across removals. Identities stay unique among
//! live entries.

use log::{debug, warn};
use shared::Connection;

/// Initial capacity of a table; it grows past this as needed
pub const DEFAULT_CAPACITY: usize = 64;

/// Growable list of live connections
///
/// Entries are handles owned by the driver. A handle replaced with the
/// default value by [`mark_dead`](ConnectionTable::mark_dead) stays in
/// place until the next [`prune`](ConnectionTable::prune).
#[derive(Debug, Clone)]
pub struct ConnectionTable {
    connections: Vec<Connection>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    /// Creates an empty table with the default capacity hint
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Vec::with_capacity(capacity),
        }
    }

    /// Removes every entry `is_live` rejects
    ///
    /// Each removal swaps the last entry into the freed slot, so it costs
    /// O(1) but does not keep accept order. The slot is examined again after
    /// a swap since it now holds an entry that was not yet checked. Returns
    /// the removed handles.
    pub fn prune(&mut self, mut is_live: impl FnMut(&Connection) -> bool) -> Vec<Connection> {
        let mut removed = Vec::new();
        let mut index = 0;

        while index < self.connections.len() {
            if is_live(&self.connections[index]) {
                index += 1;
            } else {
                removed.push(self.connections.swap_remove(index));
            }
        }

        if !removed.is_empty() {
            debug!("Pruned {} dead connections", removed.len());
        }
        removed
    }

    /// Appends connections pulled from `accept` until it runs dry
    ///
    /// Default handles and identities already present are skipped so the
    /// table never holds two live entries for the same connection. Returns
    /// the number of connections added.
    pub fn accept_pending(&mut self, mut accept: impl FnMut() -> Option<Connection>) -> usize {
        let mut added = 0;

        while let Some(connection) = accept() {
            if !connection.is_created() {
                continue;
            }
            if self.contains(connection) {
                warn!("Connection {} accepted twice", connection.id());
                continue;
            }
            self.connections.push(connection);
            added += 1;
        }

        added
    }

    /// Replaces the entry at `index` with the default handle
    ///
    /// Returns the handle that was there, if the index was valid.
    pub fn mark_dead(&mut self, index: usize) -> Option<Connection> {
        self.connections.get_mut(index).map(std::mem::take)
    }

    pub fn get(&self, index: usize) -> Option<Connection> {
        self.connections.get(index).copied()
    }

    pub fn contains(&self, connection: Connection) -> bool {
        self.connections.contains(&connection)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Removes and returns every entry
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.connections.capacity()
    }
}
