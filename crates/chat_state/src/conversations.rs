use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ChatStateError;
use crate::kv::{
    lock_unpoisoned, read_json, sweep_timer, write_json, KeyValueStore, StoreChange,
};
use crate::schema::{now_millis, Conversation, Feedback, Message, Role};
use crate::title::{title_from_content, DEFAULT_TITLE};

pub const CONVERSATIONS_KEY: &str = "chat-conversations";

pub type ConversationList = Arc<Vec<Conversation>>;

/// Owner of the persisted conversation list.
///
/// Every write reads the canonical copy, applies a function to the whole
/// collection and replaces the stored value, then publishes the result.
/// Writers in this process are serialized; other processes are reconciled
/// by re-reading on change.
pub struct ConversationStore {
    store: Arc<dyn KeyValueStore>,
    view: watch::Sender<ConversationList>,
    update_lock: Mutex<()>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &self.view.borrow().len())
            .finish_non_exhaustive()
    }
}

impl ConversationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (view, _) = watch::channel(Arc::new(Vec::new()));
        let conversations = Self {
            store,
            view,
            update_lock: Mutex::new(()),
        };
        if let Err(error) = conversations.refresh() {
            warn!(%error, "failed to load conversations; starting empty");
        }
        conversations
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationList {
        Arc::clone(&self.view.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationList> {
        self.view.subscribe()
    }

    /// Look up a conversation, re-reading the canonical copy on a miss so
    /// conversations created by another handle are found.
    #[must_use]
    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        if let Some(conversation) = find(&self.view.borrow(), conversation_id) {
            return Some(conversation);
        }
        match self.refresh() {
            Ok(conversations) => find(&conversations, conversation_id),
            Err(error) => {
                warn!(%error, conversation_id, "failed to re-read conversations");
                None
            }
        }
    }

    /// Conversations ordered by most recent update first.
    #[must_use]
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations = self.snapshot().as_ref().clone();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    /// Re-derive the view from the canonical copy.
    pub fn refresh(&self) -> Result<ConversationList, ChatStateError> {
        let conversations = Arc::new(self.read_canonical()?);
        self.publish(Arc::clone(&conversations));
        Ok(conversations)
    }

    /// Replace the whole collection with `f(current)`.
    pub fn update<F>(&self, f: F) -> Result<ConversationList, ChatStateError>
    where
        F: FnOnce(&[Conversation]) -> Vec<Conversation>,
    {
        self.modify(|conversations| {
            *conversations = f(conversations);
            Ok(())
        })?;
        Ok(self.snapshot())
    }

    /// Apply `f` to one conversation and bump its `updated_at`.
    pub fn update_conversation<F>(
        &self,
        conversation_id: &str,
        f: F,
    ) -> Result<Conversation, ChatStateError>
    where
        F: FnOnce(&mut Conversation),
    {
        self.modify(|conversations| {
            let conversation = find_mut(conversations, conversation_id)?;
            f(conversation);
            conversation.updated_at = now_millis();
            Ok(conversation.clone())
        })
    }

    pub fn update_message<F>(
        &self,
        conversation_id: &str,
        message_id: &str,
        f: F,
    ) -> Result<Message, ChatStateError>
    where
        F: FnOnce(&mut Message),
    {
        self.modify(|conversations| {
            let conversation = find_mut(conversations, conversation_id)?;
            let message = conversation
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)
                .ok_or_else(|| ChatStateError::unknown_message(conversation_id, message_id))?;
            f(message);
            let updated = message.clone();
            conversation.updated_at = now_millis();
            Ok(updated)
        })
    }

    /// Insert a new conversation at the front of the list.
    pub fn create(&self, conversation: Conversation) -> Result<Conversation, ChatStateError> {
        self.modify(|conversations| {
            conversations.retain(|existing| existing.id != conversation.id);
            conversations.insert(0, conversation.clone());
            debug!(conversation_id = %conversation.id, "created conversation");
            Ok(conversation)
        })
    }

    /// Append `message`, titling the conversation from its first user message.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), ChatStateError> {
        self.update_conversation(conversation_id, |conversation| {
            let first_user = message.role == Role::User
                && conversation.last_user_message().is_none()
                && conversation.title == DEFAULT_TITLE;
            if first_user {
                conversation.title = title_from_content(&message.content);
            }
            conversation.messages.push(message);
        })
        .map(|_| ())
    }

    /// Remove the last message when it is an assistant message.
    pub fn pop_trailing_assistant(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Message>, ChatStateError> {
        self.modify(|conversations| {
            let conversation = find_mut(conversations, conversation_id)?;
            if !conversation
                .messages
                .last()
                .is_some_and(Message::is_assistant)
            {
                return Ok(None);
            }
            let popped = conversation.messages.pop();
            conversation.updated_at = now_millis();
            Ok(popped)
        })
    }

    pub fn rename(&self, conversation_id: &str, title: &str) -> Result<(), ChatStateError> {
        let title = title.trim();
        let title = if title.is_empty() { DEFAULT_TITLE } else { title };
        self.update_conversation(conversation_id, |conversation| {
            conversation.title = title.to_string();
        })
        .map(|_| ())
    }

    /// Delete a conversation. Returns whether it existed.
    pub fn delete(&self, conversation_id: &str) -> Result<bool, ChatStateError> {
        self.modify(|conversations| {
            let before = conversations.len();
            conversations.retain(|conversation| conversation.id != conversation_id);
            Ok(conversations.len() != before)
        })
    }

    pub fn set_feedback(
        &self,
        conversation_id: &str,
        message_id: &str,
        feedback: Option<Feedback>,
    ) -> Result<(), ChatStateError> {
        self.update_message(conversation_id, message_id, |message| {
            message.feedback = feedback;
        })
        .map(|_| ())
    }

    /// Re-derive the view whenever the conversation key changes and on each
    /// sweep tick, which picks up writes made through other handles.
    pub fn spawn_watcher(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let conversations = Arc::downgrade(self);
        let changes = self.store.subscribe();
        tokio::spawn(watch_loop(conversations, changes, sweep_interval))
    }

    fn modify<R>(
        &self,
        f: impl FnOnce(&mut Vec<Conversation>) -> Result<R, ChatStateError>,
    ) -> Result<R, ChatStateError> {
        let _guard = lock_unpoisoned(&self.update_lock);
        let mut conversations = self.read_canonical()?;
        let result = f(&mut conversations)?;
        write_json(self.store.as_ref(), CONVERSATIONS_KEY, &conversations)?;
        self.publish(Arc::new(conversations));
        Ok(result)
    }

    fn read_canonical(&self) -> Result<Vec<Conversation>, ChatStateError> {
        Ok(read_json(self.store.as_ref(), CONVERSATIONS_KEY)?.unwrap_or_default())
    }

    fn publish(&self, conversations: ConversationList) {
        self.view.send_if_modified(|current| {
            if **current == *conversations {
                return false;
            }
            *current = conversations;
            true
        });
    }
}

fn find(conversations: &[Conversation], conversation_id: &str) -> Option<Conversation> {
    conversations
        .iter()
        .find(|conversation| conversation.id == conversation_id)
        .cloned()
}

fn find_mut<'a>(
    conversations: &'a mut [Conversation],
    conversation_id: &str,
) -> Result<&'a mut Conversation, ChatStateError> {
    conversations
        .iter_mut()
        .find(|conversation| conversation.id == conversation_id)
        .ok_or_else(|| ChatStateError::unknown_conversation(conversation_id))
}

async fn watch_loop(
    conversations: Weak<ConversationStore>,
    mut changes: broadcast::Receiver<StoreChange>,
    sweep_interval: Duration,
) {
    let mut sweep = sweep_timer(sweep_interval).await;

    loop {
        let should_refresh = tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => change.key == CONVERSATIONS_KEY,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "conversation watcher lagged; re-deriving");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = sweep.tick() => true,
        };
        if !should_refresh {
            continue;
        }

        let Some(conversations) = conversations.upgrade() else {
            break;
        };
        if let Err(error) = conversations.refresh() {
            warn!(%error, "conversation refresh failed");
        }
    }
}
