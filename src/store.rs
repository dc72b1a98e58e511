//! # Content Store
//!
//! Keyed blob storage for the overlay. Every record carries two deadlines:
//! a replication deadline, after which the publisher pushes the value back
//! out to the closest peers, and an expiration deadline, after which the
//! record is dropped. The once-per-second maintenance tick in the DHT drives
//! both through [`ContentStore::keys_ready_to_replicate`] and
//! [`ContentStore::expire_keys`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use crate::id::Key;

/// Upper bound on a stored value. Oversized stores are rejected.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

struct StoredRecord {
    value: Vec<u8>,
    replication_deadline: Instant,
    expiration_deadline: Instant,
    publisher: bool,
}

/// Error raised when a store request cannot be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    ValueTooLarge { size: usize },
    ExpiredOnArrival,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ValueTooLarge { size } => {
                write!(f, "value of {} bytes exceeds limit of {}", size, MAX_VALUE_SIZE)
            }
            StoreError::ExpiredOnArrival => write!(f, "expiration deadline already elapsed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Mutex-guarded keyed blob store with replication and expiration deadlines.
pub struct ContentStore {
    records: Mutex<HashMap<Key, StoredRecord>>,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a record. The expiration deadline of an existing record never
    /// regresses; the publisher flag and value follow the newest write.
    pub fn store(
        &self,
        key: Key,
        value: Vec<u8>,
        replication_deadline: Instant,
        expiration_deadline: Instant,
        publisher: bool,
    ) -> Result<(), StoreError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge { size: value.len() });
        }
        if expiration_deadline <= Instant::now() {
            return Err(StoreError::ExpiredOnArrival);
        }

        let mut records = self.records.lock().expect("content store poisoned");
        let expiration = match records.get(&key) {
            Some(existing) => existing.expiration_deadline.max(expiration_deadline),
            None => expiration_deadline,
        };
        records.insert(
            key,
            StoredRecord {
                value,
                replication_deadline,
                expiration_deadline: expiration,
                publisher,
            },
        );
        Ok(())
    }

    pub fn retrieve(&self, key: &Key) -> Option<Vec<u8>> {
        let records = self.records.lock().expect("content store poisoned");
        records.get(key).map(|r| r.value.clone())
    }

    pub fn contains(&self, key: &Key) -> bool {
        let records = self.records.lock().expect("content store poisoned");
        records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let records = self.records.lock().expect("content store poisoned");
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys whose replication deadline has elapsed and which this node
    /// published. The deadline is pushed forward by `next_deadline` so a key
    /// is handed out once per replication window.
    pub fn keys_ready_to_replicate(&self, next_deadline: Instant) -> Vec<Key> {
        let now = Instant::now();
        let mut records = self.records.lock().expect("content store poisoned");
        let mut ready = Vec::new();
        for (key, record) in records.iter_mut() {
            if record.publisher && record.replication_deadline <= now {
                record.replication_deadline = next_deadline;
                ready.push(*key);
            }
        }
        ready
    }

    /// Drop every record whose expiration deadline has elapsed.
    pub fn expire_keys(&self) {
        let now = Instant::now();
        let mut records = self.records.lock().expect("content store poisoned");
        let before = records.len();
        records.retain(|_, record| record.expiration_deadline > now);
        let dropped = before - records.len();
        if dropped > 0 {
            debug!(dropped, remaining = records.len(), "expired stored keys");
        }
    }
}
