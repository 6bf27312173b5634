use std::sync::Arc;

use tracing::warn;

use crate::error::ChatStateError;
use crate::kv::{read_json, write_json, KeyValueStore};
use crate::schema::ChatSettings;

pub const SETTINGS_KEY: &str = "chat-settings";

/// Global chat settings persisted under [`SETTINGS_KEY`].
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore").finish_non_exhaustive()
    }
}

impl SettingsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stored settings, or defaults when none are stored or they are unreadable.
    #[must_use]
    pub fn load(&self) -> ChatSettings {
        match read_json(self.store.as_ref(), SETTINGS_KEY) {
            Ok(settings) => settings.unwrap_or_default(),
            Err(error) => {
                warn!(%error, "ignoring unreadable chat settings");
                ChatSettings::default()
            }
        }
    }

    pub fn save(&self, settings: &ChatSettings) -> Result<(), ChatStateError> {
        write_json(self.store.as_ref(), SETTINGS_KEY, settings)
    }

    pub fn update<F>(&self, f: F) -> Result<ChatSettings, ChatStateError>
    where
        F: FnOnce(&mut ChatSettings),
    {
        let mut settings = self.load();
        f(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}
