use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chat_api::CancellationSignal;
use chat_state::{
    ConversationStore, FileStore, GeneratingRegistry, KeyValueStore, SettingsStore,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{ChatBackend, HttpBackend};
use crate::config::EngineConfig;
use crate::context_usage::{context_usage, ContextUsage};
use crate::error::{EngineError, LifecycleError, SyncOutcome};
use crate::lifecycle::ConversationLifecycle;
use crate::reconcile::ReconciliationSync;

/// Stores, registry, lifecycle and reconciliation wired over one shared store.
pub struct Engine {
    config: EngineConfig,
    conversations: Arc<ConversationStore>,
    registry: Arc<GeneratingRegistry>,
    settings: SettingsStore,
    lifecycle: Arc<ConversationLifecycle>,
    sync: Arc<ReconciliationSync>,
    activation: Mutex<Option<CancellationSignal>>,
    watchers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("watchers", &self.watchers.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let conversations = Arc::new(ConversationStore::new(Arc::clone(&store)));
        let registry = Arc::new(GeneratingRegistry::with_stale_after(
            Arc::clone(&store),
            config.stale_after,
        ));
        let settings = SettingsStore::new(store);
        let lifecycle = Arc::new(ConversationLifecycle::new(
            Arc::clone(&backend),
            Arc::clone(&conversations),
            Arc::clone(&registry),
            settings.clone(),
        ));
        let sync = Arc::new(
            ReconciliationSync::new(backend, Arc::clone(&conversations), Arc::clone(&registry))
                .with_poll_policy(config.sync_interval, config.sync_max_attempts),
        );

        Self {
            config,
            conversations,
            registry,
            settings,
            lifecycle,
            sync,
            activation: Mutex::new(None),
            watchers: Vec::new(),
        }
    }

    /// Engine over the HTTP backend and a file store in `config.state_dir`.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let backend = Arc::new(HttpBackend::new(config.api_config())?);
        let store = Arc::new(FileStore::open(&config.state_dir)?);
        info!(
            base_url = %config.base_url,
            state_dir = %config.state_dir.display(),
            "engine opened"
        );
        Ok(Self::new(config, backend, store))
    }

    /// Start background re-derivation of shared state. Needs a Tokio runtime.
    pub fn start_watchers(&mut self) {
        if !self.watchers.is_empty() {
            return;
        }
        self.watchers
            .push(self.registry.spawn_watcher(self.config.sweep_interval));
        self.watchers
            .push(self.conversations.spawn_watcher(self.config.sweep_interval));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn registry(&self) -> &Arc<GeneratingRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn lifecycle(&self) -> &Arc<ConversationLifecycle> {
        &self.lifecycle
    }

    pub fn sync(&self) -> &Arc<ReconciliationSync> {
        &self.sync
    }

    /// Select `conversation_id` and reconcile it with the server.
    ///
    /// Any polling left over from a previous activation is stopped first.
    /// A conversation this engine is streaming itself is not reconciled.
    pub async fn activate(&self, conversation_id: &str) -> Result<SyncOutcome, LifecycleError> {
        self.lifecycle.select(conversation_id)?;

        let cancel: CancellationSignal = Arc::new(AtomicBool::new(false));
        {
            let mut activation = match self.activation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(previous) = activation.replace(Arc::clone(&cancel)) {
                previous.store(true, Ordering::Release);
            }
        }

        if self.lifecycle.is_streaming(conversation_id) {
            debug!(conversation_id, "skipping reconciliation of local stream");
            return Ok(SyncOutcome::NotSynced);
        }
        Ok(self.sync.activate(conversation_id, Some(&cancel)).await)
    }

    #[must_use]
    pub fn context_usage(&self, conversation_id: &str) -> Option<ContextUsage> {
        self.conversations
            .get(conversation_id)
            .map(|conversation| context_usage(&conversation, &self.config.context))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}
