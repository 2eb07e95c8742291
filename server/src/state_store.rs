//! Per-connection message history kept by the server
//!
//! Every connection that has sent at least one message owns a record of the
//! last payload received per message kind, plus the time of the most recent
//! receipt. Records live in memory only. By default nothing is ever evicted;
//! [`StoreConfig`] opts into eviction by age, by count or on disconnect.

use log::debug;
use shared::{timestamp_millis, MessageKind, Snapshot};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Eviction knobs for the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Evict records not updated for longer than this
    pub ttl: Option<Duration>,
    /// Evict the least recently updated record to admit a new one
    pub max_connections: Option<usize>,
    /// Drop a record as soon as its connection goes away
    pub evict_on_disconnect: bool,
}

/// History of one connection
///
/// Core metadata is kept apart from the user message map so a user kind can
/// never overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRecord {
    last_update: Option<u64>,
    messages: BTreeMap<MessageKind, Option<String>>,
}

impl ConnectionRecord {
    /// Milliseconds since the Unix epoch of the latest receipt
    pub fn last_update(&self) -> Option<u64> {
        self.last_update
    }

    /// Last payload for `kind`; the outer `None` means never received
    pub fn message(&self, kind: MessageKind) -> Option<Option<&str>> {
        self.messages.get(&kind).map(|payload| payload.as_deref())
    }

    pub fn messages(&self) -> &BTreeMap<MessageKind, Option<String>> {
        &self.messages
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.messages.clone();
        if let Some(timestamp) = self.last_update {
            snapshot.insert(MessageKind::LastUpdateTime, Some(timestamp.to_string()));
        }
        snapshot
    }
}

#[derive(Debug, Default)]
pub struct StateStore {
    config: StoreConfig,
    records: HashMap<u32, ConnectionRecord>,
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Records `payload` as the latest `kind` received from `connection_id`
    pub fn update(&mut self, connection_id: u32, kind: MessageKind, payload: Option<String>) {
        self.update_at(connection_id, kind, payload, timestamp_millis());
    }

    /// Same as [`update`](Self::update) with an explicit receipt time
    ///
    /// The record is created on first use. Reserved kinds only refresh the
    /// receipt time.
    pub fn update_at(
        &mut self,
        connection_id: u32,
        kind: MessageKind,
        payload: Option<String>,
        now_millis: u64,
    ) {
        if !self.records.contains_key(&connection_id) {
            self.make_room();
        }

        let record = self.records.entry(connection_id).or_default();
        record.last_update = Some(now_millis);
        if !kind.is_reserved() {
            record.messages.insert(kind, payload);
        }
    }

    fn make_room(&mut self) {
        let Some(max) = self.config.max_connections else {
            return;
        };

        while self.records.len() >= max {
            let oldest = self
                .records
                .iter()
                .min_by_key(|(id, record)| (record.last_update, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    debug!("Evicting record of connection {} to make room", id);
                    self.records.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Drops every record older than the configured TTL
    ///
    /// Returns the evicted connection ids in ascending order. Does nothing
    /// without a TTL.
    pub fn evict_stale(&mut self, now_millis: u64) -> Vec<u32> {
        let Some(ttl) = self.config.ttl else {
            return Vec::new();
        };
        let ttl_millis = ttl.as_millis().min(u64::MAX as u128) as u64;

        let mut evicted: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, record)| {
                record
                    .last_update
                    .map_or(true, |at| now_millis.saturating_sub(at) > ttl_millis)
            })
            .map(|(id, _)| *id)
            .collect();
        evicted.sort_unstable();

        for id in &evicted {
            self.records.remove(id);
        }
        if !evicted.is_empty() {
            debug!("Evicted {} stale records", evicted.len());
        }
        evicted
    }

    /// Called when a connection goes away; returns true if its record was
    /// dropped
    pub fn on_disconnect(&mut self, connection_id: u32) -> bool {
        self.config.evict_on_disconnect && self.records.remove(&connection_id).is_some()
    }

    pub fn remove(&mut self, connection_id: u32) -> Option<ConnectionRecord> {
        self.records.remove(&connection_id)
    }

    pub fn get(&self, connection_id: u32) -> Option<&ConnectionRecord> {
        self.records.get(&connection_id)
    }

    pub fn snapshot(&self, connection_id: u32) -> Option<Snapshot> {
        self.records.get(&connection_id).map(ConnectionRecord::snapshot)
    }

    /// JSON of one connection's snapshot, `{}` if it has none
    ///
    /// This is the body the server sends back after every message.
    pub fn serialize(&self, connection_id: u32) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot(connection_id).unwrap_or_default())
    }

    /// JSON of every record keyed by connection id, in ascending id order
    pub fn serialize_all(&self) -> Result<String, serde_json::Error> {
        let all: BTreeMap<u32, Snapshot> = self
            .records
            .iter()
            .map(|(id, record)| (*id, record.snapshot()))
            .collect();
        serde_json::to_string(&all)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
