use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ChatStateError;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Shortest period a watcher sweep will tick at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Notification that the value under `key` was replaced or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

/// Externally-owned string store shared between execution contexts.
///
/// Values are replaced whole; there is no partial update. Every subscriber
/// receives a [`StoreChange`] after a write that altered a key, including
/// writes made through the same handle.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ChatStateError>;

    fn set(&self, key: &str, value: &str) -> Result<(), ChatStateError>;

    fn remove(&self, key: &str) -> Result<(), ChatStateError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Periodic re-derivation timer for a store watcher. The first tick is
/// consumed so the sweep fires one full period after spawning.
pub(crate) async fn sweep_timer(period: Duration) -> tokio::time::Interval {
    let mut sweep = tokio::time::interval(period.max(MIN_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep.tick().await;
    sweep
}

/// Read and decode the JSON value stored under `key`.
pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, ChatStateError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ChatStateError::json_parse(key, source)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and replace whatever is stored under `key`.
pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), ChatStateError> {
    let raw =
        serde_json::to_string(value).map_err(|source| ChatStateError::json_serialize(key, source))?;
    store.set(key, &raw)
}

/// Process-local store. Handles cloned through an `Arc` observe each other's writes.
#[derive(Debug)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &str) {
        // No subscribers is not an error.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ChatStateError> {
        Ok(lock_unpoisoned(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatStateError> {
        let changed = {
            let mut values = lock_unpoisoned(&self.values);
            let previous = values.insert(key.to_string(), value.to_string());
            previous.as_deref() != Some(value)
        };
        if changed {
            self.notify(key);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ChatStateError> {
        let removed = lock_unpoisoned(&self.values).remove(key).is_some();
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
