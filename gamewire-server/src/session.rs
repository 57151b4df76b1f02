//! Pending handshake validations.
//!
//! A record exists from the moment the challenge is sent until the echo
//! arrives, the connection drops, or the sweep evicts it.

use dashmap::DashMap;
use gamewire_protocol::ConnectionHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Handshake state of one unvalidated connection.
#[derive(Debug, Clone)]
pub struct ValidationRecord {
    pub connection: ConnectionHandle,
    pub challenge: u64,
    pub created_at: Instant,
}

impl ValidationRecord {
    pub fn new(connection: ConnectionHandle, challenge: u64) -> Self {
        Self {
            connection,
            challenge,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Concurrent table of pending validations keyed by connection id.
#[derive(Debug, Default)]
pub struct ValidationTable {
    records: DashMap<Uuid, ValidationRecord>,
}

impl ValidationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ValidationRecord) {
        self.records.insert(record.connection.id(), record);
    }

    /// Removes and returns the record for `id`.
    pub fn take(&self, id: &Uuid) -> Option<ValidationRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.records.remove(id).is_some()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evicts records older than `timeout` and closes their connections.
    ///
    /// Returns the number of evicted records. Safe to call concurrently; a
    /// record is evicted by exactly one caller.
    pub fn sweep(&self, timeout: Duration) -> usize {
        let mut expired = Vec::new();
        self.records.retain(|_, record| {
            if record.age() >= timeout {
                expired.push(record.connection.clone());
                false
            } else {
                true
            }
        });

        for conn in &expired {
            tracing::warn!(
                "[{}] Handshake not completed within {:?}, closing",
                conn.peer_addr(),
                timeout
            );
            conn.close();
        }
        expired.len()
    }
}
