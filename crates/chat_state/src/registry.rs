use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChatStateError;
use crate::kv::{
    lock_unpoisoned, read_json, sweep_timer, write_json, KeyValueStore, StoreChange,
};
use crate::schema::{now_millis, GeneratingEntry, Millis};

pub const GENERATING_KEY: &str = "chat-generating";

/// Entries older than this are treated as abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

pub type GeneratingMap = BTreeMap<String, GeneratingEntry>;

/// Persisted map of conversations with an outstanding generation.
///
/// The canonical copy lives in the shared store under [`GENERATING_KEY`].
/// Every mutation is a read-modify-write of that copy, and the published
/// view is always re-derived from it, never patched in place.
pub struct GeneratingRegistry {
    store: Arc<dyn KeyValueStore>,
    stale_after: Duration,
    view: watch::Sender<GeneratingMap>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for GeneratingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratingRegistry")
            .field("stale_after", &self.stale_after)
            .field("entries", &*self.view.borrow())
            .finish_non_exhaustive()
    }
}

impl GeneratingRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_stale_after(store, DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(store: Arc<dyn KeyValueStore>, stale_after: Duration) -> Self {
        let (view, _) = watch::channel(GeneratingMap::new());
        let registry = Self {
            store,
            stale_after,
            view,
            write_lock: Mutex::new(()),
        };
        if let Err(error) = registry.refresh() {
            warn!(%error, "failed to load generating registry");
        }
        registry
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Record that a send for `conversation_id` has begun.
    pub fn mark(&self, conversation_id: &str, backend: &str) -> Result<(), ChatStateError> {
        self.mark_at(conversation_id, backend, now_millis())
    }

    pub fn mark_at(
        &self,
        conversation_id: &str,
        backend: &str,
        started_at: Millis,
    ) -> Result<(), ChatStateError> {
        let _guard = lock_unpoisoned(&self.write_lock);
        let mut entries = self.read_canonical();
        entries.insert(
            conversation_id.to_string(),
            GeneratingEntry {
                conversation_id: conversation_id.to_string(),
                started_at,
                backend: backend.to_string(),
            },
        );
        write_json(self.store.as_ref(), GENERATING_KEY, &entries)?;
        debug!(conversation_id, backend, "marked conversation as generating");
        self.publish(entries);
        Ok(())
    }

    /// Remove the entry for `conversation_id`. Returns whether one existed.
    pub fn clear(&self, conversation_id: &str) -> Result<bool, ChatStateError> {
        let _guard = lock_unpoisoned(&self.write_lock);
        let mut entries = self.read_canonical();
        let removed = entries.remove(conversation_id).is_some();
        if removed {
            write_json(self.store.as_ref(), GENERATING_KEY, &entries)?;
            debug!(conversation_id, "cleared generating entry");
        }
        self.publish(entries);
        Ok(removed)
    }

    /// Whether the canonical copy currently lists `conversation_id`.
    pub fn is_generating(&self, conversation_id: &str) -> bool {
        self.entry(conversation_id).is_some()
    }

    pub fn entry(&self, conversation_id: &str) -> Option<GeneratingEntry> {
        match self.refresh() {
            Ok(entries) => entries.get(conversation_id).cloned(),
            Err(error) => {
                warn!(%error, "generating registry refresh failed; using last view");
                self.view.borrow().get(conversation_id).cloned()
            }
        }
    }

    /// Last published view, without consulting the store.
    #[must_use]
    pub fn snapshot(&self) -> GeneratingMap {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GeneratingMap> {
        self.view.subscribe()
    }

    /// Re-derive the view from the canonical copy, purging stale entries.
    pub fn refresh(&self) -> Result<GeneratingMap, ChatStateError> {
        self.refresh_at(now_millis())
    }

    pub fn refresh_at(&self, now: Millis) -> Result<GeneratingMap, ChatStateError> {
        let _guard = lock_unpoisoned(&self.write_lock);
        let mut entries = self.read_canonical();
        let stale_after_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_stale(now, stale_after_ms));
        let purged = before - entries.len();
        if purged > 0 {
            write_json(self.store.as_ref(), GENERATING_KEY, &entries)?;
            info!(purged, "purged stale generating entries");
        }

        self.publish(entries.clone());
        Ok(entries)
    }

    /// Keep the view in sync with the store from a background task.
    ///
    /// The task re-derives on every change to [`GENERATING_KEY`] and on each
    /// sweep tick. It exits once the registry is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let changes = self.store.subscribe();
        tokio::spawn(watch_loop(registry, changes, sweep_interval))
    }

    fn read_canonical(&self) -> GeneratingMap {
        match read_json::<GeneratingMap>(self.store.as_ref(), GENERATING_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "discarding unreadable generating registry");
                GeneratingMap::new()
            }
        }
    }

    fn publish(&self, entries: GeneratingMap) {
        self.view.send_if_modified(|current| {
            if *current == entries {
                return false;
            }
            *current = entries;
            true
        });
    }
}

async fn watch_loop(
    registry: Weak<GeneratingRegistry>,
    mut changes: broadcast::Receiver<StoreChange>,
    sweep_interval: Duration,
) {
    let mut sweep = sweep_timer(sweep_interval).await;

    loop {
        let should_refresh = tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => change.key == GENERATING_KEY,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "generating watcher lagged; re-deriving");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = sweep.tick() => true,
        };
        if !should_refresh {
            continue;
        }

        let Some(registry) = registry.upgrade() else {
            break;
        };
        if let Err(error) = registry.refresh() {
            warn!(%error, "generating registry sweep failed");
        }
    }
}
