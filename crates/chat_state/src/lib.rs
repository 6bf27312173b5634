//! Persisted local state shared by every engine instance reading the same store.
//!
//! All shared values live in a [`KeyValueStore`] under fixed keys and are
//! written by whole-value replacement. Readers re-derive their view from the
//! canonical copy whenever the store reports a change.

mod conversations;
mod error;
mod file_store;
mod kv;
mod registry;
mod schema;
mod settings;
mod title;

pub use conversations::{ConversationList, ConversationStore, CONVERSATIONS_KEY};
pub use error::ChatStateError;
pub use file_store::{key_file_name, FileStore};
pub use kv::{
    read_json, write_json, KeyValueStore, MemoryStore, StoreChange, MIN_SWEEP_INTERVAL,
};
pub use registry::{GeneratingMap, GeneratingRegistry, DEFAULT_STALE_AFTER, GENERATING_KEY};
pub use schema::{
    new_id, now_millis, ChatSettings, Conversation, Feedback, GeneratingEntry, Message, Millis,
    Role, ToolStatus, ToolUse,
};
pub use settings::{SettingsStore, SETTINGS_KEY};
pub use title::{title_from_content, DEFAULT_TITLE, TITLE_MAX_CHARS};
