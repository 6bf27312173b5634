//! Merge server-persisted transcripts into local conversations.

use std::sync::Arc;
use std::time::Duration;

use chat_api::client::{await_or_cancel, is_cancelled};
use chat_api::{CancellationSignal, EmbeddedEvent, EmbeddedEventParser, TranscriptMessage};
use chat_state::{ConversationStore, GeneratingRegistry, Message, Role};
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;
use crate::config::{DEFAULT_SYNC_INTERVAL, DEFAULT_SYNC_MAX_ATTEMPTS};
use crate::error::SyncOutcome;

/// Best-effort transcript reconciliation. Never reports errors to callers.
pub struct ReconciliationSync {
    backend: Arc<dyn ChatBackend>,
    conversations: Arc<ConversationStore>,
    registry: Arc<GeneratingRegistry>,
    interval: Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for ReconciliationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationSync")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ReconciliationSync {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        conversations: Arc<ConversationStore>,
        registry: Arc<GeneratingRegistry>,
    ) -> Self {
        Self {
            backend,
            conversations,
            registry,
            interval: DEFAULT_SYNC_INTERVAL,
            max_attempts: DEFAULT_SYNC_MAX_ATTEMPTS,
        }
    }

    pub fn with_poll_policy(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.interval = interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fetch the transcript once and append its latest assistant message if
    /// it is newer than anything held locally.
    pub async fn sync_once(&self, conversation_id: &str) -> SyncOutcome {
        self.sync_with(conversation_id, None).await
    }

    async fn sync_with(
        &self,
        conversation_id: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> SyncOutcome {
        let fetch = self.backend.fetch_transcript(conversation_id);
        let transcript = match await_or_cancel(fetch, cancellation).await {
            Ok(Ok(transcript)) => transcript,
            Err(_) => {
                debug!(conversation_id, "transcript fetch cancelled");
                return SyncOutcome::TransientFailure;
            }
            Ok(Err(error)) => {
                debug!(%error, conversation_id, "transcript fetch failed");
                return SyncOutcome::TransientFailure;
            }
        };
        let Some(remote) = transcript.latest_assistant() else {
            return SyncOutcome::NotSynced;
        };
        let Some(local) = self.conversations.get(conversation_id) else {
            debug!(conversation_id, "no local conversation to reconcile");
            return SyncOutcome::NotSynced;
        };

        let local_latest = local.latest_assistant().map(|message| message.timestamp);
        if local_latest.is_some_and(|timestamp| remote.ts <= timestamp) {
            return SyncOutcome::NotSynced;
        }

        let mut appended = false;
        let message = message_from_transcript(remote);
        let update = self
            .conversations
            .update_conversation(conversation_id, |conversation| {
                if conversation.has_message(&message.id) {
                    return;
                }
                conversation.messages.push(message.clone());
                appended = true;
            });
        if let Err(error) = update {
            warn!(%error, conversation_id, "failed to store reconciled message");
            return SyncOutcome::TransientFailure;
        }
        if !appended {
            return SyncOutcome::NotSynced;
        }

        if let Err(error) = self.registry.clear(conversation_id) {
            warn!(%error, conversation_id, "failed to clear generating entry after sync");
        }
        info!(conversation_id, message_id = %message.id, "reconciled message from transcript");
        SyncOutcome::Synced
    }

    /// Reconcile a conversation that just became active.
    ///
    /// When the registry lists it as generating, polling continues until a
    /// sync happens or the attempts run out; in the latter case the entry is
    /// cleared anyway. Raising `cancellation` stops polling without touching
    /// the registry.
    pub async fn activate(
        &self,
        conversation_id: &str,
        cancellation: Option<&CancellationSignal>,
    ) -> SyncOutcome {
        let was_generating = self.registry.is_generating(conversation_id);
        let mut outcome = self.sync_with(conversation_id, cancellation).await;
        if !was_generating || outcome == SyncOutcome::Synced || is_cancelled(cancellation) {
            return outcome;
        }

        debug!(
            conversation_id,
            max_attempts = self.max_attempts,
            "polling transcript for background generation"
        );
        for _ in 1..self.max_attempts {
            if await_or_cancel(tokio::time::sleep(self.interval), cancellation)
                .await
                .is_err()
            {
                debug!(conversation_id, "transcript polling cancelled");
                return outcome;
            }
            outcome = self.sync_with(conversation_id, cancellation).await;
            if outcome == SyncOutcome::Synced || is_cancelled(cancellation) {
                return outcome;
            }
        }

        if is_cancelled(cancellation) {
            return outcome;
        }
        info!(
            conversation_id,
            "no completion observed; giving up on generating entry"
        );
        if let Err(error) = self.registry.clear(conversation_id) {
            warn!(%error, conversation_id, "failed to clear generating entry");
        }
        SyncOutcome::NotSynced
    }
}

/// Local message for a transcript entry, with embedded tool events applied.
fn message_from_transcript(remote: &TranscriptMessage) -> Message {
    let parsed = EmbeddedEventParser::parse_all(&remote.content);
    let mut message = Message {
        id: remote.id.clone(),
        timestamp: remote.ts,
        model: remote.model.clone(),
        ..Message::new(
            Role::parse(&remote.role).unwrap_or(Role::Assistant),
            parsed.text,
        )
    };
    for event in parsed.events {
        match event {
            EmbeddedEvent::ToolStart { id, name, input } => {
                message.start_tool(&id, &name, input);
            }
            EmbeddedEvent::ToolEnd { id, input } => {
                message.finish_tool(&id, input);
            }
            EmbeddedEvent::Heartbeat => {}
        }
    }
    message
}
