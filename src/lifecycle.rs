//! Send, cancel, regenerate and continue-in-new-chat.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chat_api::client::await_or_cancel;
use chat_api::{
    decode_byte_stream, ByteStream, CancellationSignal, DecodedChunk, EmbeddedEvent,
    EmbeddedEventParser, GenerationRequest, ParsedText, StreamPayload, WireMessage,
};
use chat_state::{
    ChatStateError, Conversation, ConversationStore, GeneratingRegistry, Message, SettingsStore,
    DEFAULT_TITLE,
};
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;
use crate::compaction::compaction_prompt;
use crate::error::{LifecycleError, SendOutcome};
use crate::phase::SendPhase;

type SendId = u64;

/// The stream currently owned by this lifecycle.
struct InFlight {
    send_id: SendId,
    conversation_id: String,
    cancel: CancellationSignal,
}

/// A send in progress, as seen by the stream loop.
struct SendTicket {
    send_id: SendId,
    conversation_id: String,
    cancel: CancellationSignal,
}

enum StreamEnd {
    Completed,
    Aborted,
    Errored(String),
}

/// Orchestrates sends for one engine instance.
///
/// At most one locally-initiated stream exists at a time: starting a send
/// cancels whatever stream this instance was reading before.
pub struct ConversationLifecycle {
    backend: Arc<dyn ChatBackend>,
    conversations: Arc<ConversationStore>,
    registry: Arc<GeneratingRegistry>,
    settings: SettingsStore,
    active: watch::Sender<Option<String>>,
    phase: watch::Sender<SendPhase>,
    in_flight: Mutex<Option<InFlight>>,
    next_send_id: AtomicU64,
}

impl std::fmt::Debug for ConversationLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLifecycle")
            .field("active", &*self.active.borrow())
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl ConversationLifecycle {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        conversations: Arc<ConversationStore>,
        registry: Arc<GeneratingRegistry>,
        settings: SettingsStore,
    ) -> Self {
        let (active, _) = watch::channel(None);
        let (phase, _) = watch::channel(SendPhase::Idle);
        Self {
            backend,
            conversations,
            registry,
            settings,
            active,
            phase,
            in_flight: Mutex::new(None),
            next_send_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn active_conversation(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<String>> {
        self.active.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> SendPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SendPhase> {
        self.phase.subscribe()
    }

    /// Make `conversation_id` the active conversation.
    pub fn select(&self, conversation_id: &str) -> Result<(), LifecycleError> {
        if self.conversations.get(conversation_id).is_none() {
            return Err(LifecycleError::UnknownConversation {
                id: conversation_id.to_string(),
            });
        }
        self.set_active(Some(conversation_id.to_string()));
        Ok(())
    }

    /// Create an empty conversation and make it active.
    pub fn new_conversation(&self) -> Result<String, LifecycleError> {
        let created = self.conversations.create(Conversation::new(DEFAULT_TITLE))?;
        self.set_active(Some(created.id.clone()));
        Ok(created.id)
    }

    /// Whether this instance is reading a stream for `conversation_id`.
    #[must_use]
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.lock_in_flight()
            .as_ref()
            .is_some_and(|in_flight| in_flight.conversation_id == conversation_id)
    }

    /// Cancel the local stream, if any. Remote generation is unaffected.
    pub fn abort(&self) -> bool {
        match self.lock_in_flight().as_ref() {
            Some(in_flight) => {
                info!(
                    conversation_id = %in_flight.conversation_id,
                    "aborting local stream"
                );
                in_flight.cancel.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Send `text` to the active conversation, creating one if none is active.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, LifecycleError> {
        let conversation_id = match self.active_conversation() {
            Some(id) => id,
            None => {
                if text.trim().is_empty() {
                    return Err(LifecycleError::EmptyPrompt);
                }
                self.new_conversation()?
            }
        };
        self.send_to(&conversation_id, text).await
    }

    pub async fn send_to(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<SendOutcome, LifecycleError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LifecycleError::EmptyPrompt);
        }
        let conversation = self.require_conversation(conversation_id)?;

        let ticket = self.begin_send(conversation_id);
        let outcome = self.send_prepared(&ticket, conversation, text).await;
        self.finish_send(&ticket, &outcome);
        outcome
    }

    /// Drop a trailing assistant reply and generate a new one.
    pub async fn regenerate(&self) -> Result<SendOutcome, LifecycleError> {
        let conversation_id = self
            .active_conversation()
            .ok_or(LifecycleError::NoActiveConversation)?;
        self.regenerate_in(&conversation_id).await
    }

    pub async fn regenerate_in(
        &self,
        conversation_id: &str,
    ) -> Result<SendOutcome, LifecycleError> {
        let conversation = self.require_conversation(conversation_id)?;
        if conversation.last_user_message().is_none() {
            return Err(LifecycleError::NothingToRegenerate {
                id: conversation_id.to_string(),
            });
        }

        let ticket = self.begin_send(conversation_id);
        let outcome = self.regenerate_prepared(&ticket).await;
        self.finish_send(&ticket, &outcome);
        outcome
    }

    /// Start a new conversation seeded with a summary of `conversation_id`.
    ///
    /// The new conversation inherits model, settings and working directory
    /// but not the backend session. It becomes the active conversation.
    pub async fn continue_in_new_chat(
        &self,
        conversation_id: &str,
    ) -> Result<(String, SendOutcome), LifecycleError> {
        let source = self.require_conversation(conversation_id)?;
        let prompt = compaction_prompt(&source);

        let mut continuation = Conversation::new(format!("{} (continued)", source.title));
        continuation.backend = source.backend.clone();
        continuation.model = source.model.clone();
        continuation.cwd = source.cwd.clone();
        continuation.settings = source.settings.clone();
        continuation.agent_id = source.agent_id.clone();
        let created = self.conversations.create(continuation)?;
        info!(
            from = conversation_id,
            to = %created.id,
            "continuing conversation in a new chat"
        );

        self.set_active(Some(created.id.clone()));
        let outcome = self.send_to(&created.id, &prompt).await?;
        Ok((created.id, outcome))
    }

    async fn send_prepared(
        &self,
        ticket: &SendTicket,
        conversation: Conversation,
        text: &str,
    ) -> Result<SendOutcome, LifecycleError> {
        if !conversation.has_snapshot() {
            let global = self.settings.load();
            self.conversations
                .update_conversation(&ticket.conversation_id, |conversation| {
                    conversation.backend = Some(global.backend.clone());
                    conversation.model = Some(global.model.clone());
                    conversation.cwd = global.cwd.clone();
                    conversation.settings = Some(global.settings.clone());
                    conversation.agent_id = global.agent_id.clone();
                })?;
        }
        self.conversations
            .append_message(&ticket.conversation_id, Message::user(text))?;
        self.generate(ticket).await
    }

    async fn regenerate_prepared(
        &self,
        ticket: &SendTicket,
    ) -> Result<SendOutcome, LifecycleError> {
        if let Some(removed) = self
            .conversations
            .pop_trailing_assistant(&ticket.conversation_id)?
        {
            debug!(message_id = %removed.id, "removed trailing assistant message");
        }
        self.generate(ticket).await
    }

    /// Issue the request for the conversation's current history and consume
    /// the response into a new assistant message.
    async fn generate(&self, ticket: &SendTicket) -> Result<SendOutcome, LifecycleError> {
        let conversation = self.require_conversation(&ticket.conversation_id)?;
        let request = self.build_request(&conversation);
        self.registry.mark(&ticket.conversation_id, &request.backend)?;

        self.transition(
            ticket,
            SendPhase::AwaitingFirstToken {
                conversation_id: ticket.conversation_id.clone(),
            },
        );
        let opened = self.backend.open_stream(&request, Some(&ticket.cancel)).await;
        let body = match opened {
            Ok(body) => body,
            Err(error) if error.is_cancelled() => {
                return self.end_send(ticket, None, StreamEnd::Aborted);
            }
            Err(error) => {
                warn!(
                    %error,
                    conversation_id = %ticket.conversation_id,
                    "generation request failed"
                );
                return self.end_send(ticket, None, StreamEnd::Errored(error.to_string()));
            }
        };

        let placeholder = Message::streaming_placeholder(Some(request.model.clone()));
        let message_id = placeholder.id.clone();
        if let Err(error) = self
            .conversations
            .append_message(&ticket.conversation_id, placeholder)
        {
            warn!(%error, conversation_id = %ticket.conversation_id, "failed to store placeholder");
            return self.end_send(ticket, None, StreamEnd::Errored(error.to_string()));
        }
        self.transition(
            ticket,
            SendPhase::Streaming {
                conversation_id: ticket.conversation_id.clone(),
                message_id: message_id.clone(),
            },
        );

        let end = match self.consume_stream(ticket, &message_id, body).await {
            Ok(end) => end,
            Err(_) if is_cancelled(&ticket.cancel) => StreamEnd::Aborted,
            Err(error) => {
                warn!(%error, conversation_id = %ticket.conversation_id, "stream update failed");
                StreamEnd::Errored(error.to_string())
            }
        };
        self.end_send(ticket, Some(&message_id), end)
    }

    async fn consume_stream(
        &self,
        ticket: &SendTicket,
        message_id: &str,
        body: ByteStream,
    ) -> Result<StreamEnd, LifecycleError> {
        let mut chunks = Box::pin(decode_byte_stream(body));
        let mut parser = EmbeddedEventParser::default();

        loop {
            let next = match await_or_cancel(chunks.next(), Some(&ticket.cancel)).await {
                Ok(next) => next,
                Err(_) => return Ok(StreamEnd::Aborted),
            };
            match next {
                None => {
                    warn!(
                        conversation_id = %ticket.conversation_id,
                        "stream ended without terminal marker"
                    );
                    self.flush_parser(ticket, message_id, &mut parser)?;
                    return Ok(StreamEnd::Completed);
                }
                Some(Err(error)) if error.is_cancelled() => return Ok(StreamEnd::Aborted),
                Some(Err(error)) => {
                    warn!(%error, conversation_id = %ticket.conversation_id, "stream read failed");
                    self.flush_parser(ticket, message_id, &mut parser)?;
                    return Ok(StreamEnd::Errored(error.to_string()));
                }
                Some(Ok(DecodedChunk::Done)) => {
                    self.flush_parser(ticket, message_id, &mut parser)?;
                    return Ok(StreamEnd::Completed);
                }
                Some(Ok(DecodedChunk::Payload(payload))) => {
                    if is_cancelled(&ticket.cancel) {
                        return Ok(StreamEnd::Aborted);
                    }
                    let error = payload.error.clone();
                    let done = payload.is_done();
                    self.apply_payload(ticket, message_id, &mut parser, payload)?;
                    if let Some(error) = error {
                        self.flush_parser(ticket, message_id, &mut parser)?;
                        return Ok(StreamEnd::Errored(error));
                    }
                    if done {
                        self.flush_parser(ticket, message_id, &mut parser)?;
                        return Ok(StreamEnd::Completed);
                    }
                }
            }
        }
    }

    fn apply_payload(
        &self,
        ticket: &SendTicket,
        message_id: &str,
        parser: &mut EmbeddedEventParser,
        payload: StreamPayload,
    ) -> Result<(), ChatStateError> {
        if let Some(content) = payload.content.as_deref() {
            let parsed = parser.push(content);
            if !parsed.is_empty() {
                self.apply_parsed(ticket, message_id, parsed)?;
            }
        }

        if payload.session_id.is_none() && payload.usage.is_none() {
            return Ok(());
        }
        self.conversations
            .update_conversation(&ticket.conversation_id, |conversation| {
                if let Some(session_id) = payload.session_id {
                    conversation.session_id = Some(session_id);
                }
                if let Some(usage) = payload.usage {
                    conversation.record_usage(usage);
                }
            })?;
        Ok(())
    }

    fn apply_parsed(
        &self,
        ticket: &SendTicket,
        message_id: &str,
        parsed: ParsedText,
    ) -> Result<(), ChatStateError> {
        self.conversations
            .update_message(&ticket.conversation_id, message_id, |message| {
                message.content.push_str(&parsed.text);
                for event in parsed.events {
                    match event {
                        EmbeddedEvent::ToolStart { id, name, input } => {
                            message.start_tool(&id, &name, input);
                        }
                        EmbeddedEvent::ToolEnd { id, input } => {
                            if !message.finish_tool(&id, input) {
                                debug!(tool_id = %id, "ignoring end of unknown tool");
                            }
                        }
                        EmbeddedEvent::Heartbeat => {}
                    }
                }
            })?;
        Ok(())
    }

    fn flush_parser(
        &self,
        ticket: &SendTicket,
        message_id: &str,
        parser: &mut EmbeddedEventParser,
    ) -> Result<(), ChatStateError> {
        let text = parser.finish();
        if text.is_empty() {
            return Ok(());
        }
        self.apply_parsed(
            ticket,
            message_id,
            ParsedText {
                text,
                events: Vec::new(),
            },
        )
    }

    /// Record the terminal state of a send in the store, registry and phase.
    ///
    /// Always publishes a terminal phase. Store failures while settling a
    /// completed stream turn it into an errored one.
    fn end_send(
        &self,
        ticket: &SendTicket,
        message_id: Option<&str>,
        end: StreamEnd,
    ) -> Result<SendOutcome, LifecycleError> {
        let conversation_id = ticket.conversation_id.as_str();
        match end {
            StreamEnd::Completed => {
                if let Some(message_id) = message_id {
                    let settled = self
                        .conversations
                        .update_message(conversation_id, message_id, |message| {
                            message.is_streaming = false;
                        });
                    if let Err(error) = settled {
                        warn!(%error, conversation_id, "failed to settle completed message");
                        return self.end_send(
                            ticket,
                            Some(message_id),
                            StreamEnd::Errored(error.to_string()),
                        );
                    }
                }
                self.clear_generating(conversation_id);
                info!(conversation_id, "generation completed");
                self.transition(
                    ticket,
                    SendPhase::Completed {
                        conversation_id: conversation_id.to_string(),
                    },
                );
                Ok(SendOutcome::Completed)
            }
            StreamEnd::Aborted => {
                if let Some(message_id) = message_id {
                    if let Err(error) = self.stop_streaming_if_present(conversation_id, message_id)
                    {
                        warn!(%error, conversation_id, "failed to settle aborted message");
                    }
                }
                info!(conversation_id, "generation aborted locally; registry entry kept");
                self.transition(
                    ticket,
                    SendPhase::Aborted {
                        conversation_id: conversation_id.to_string(),
                    },
                );
                Ok(SendOutcome::Aborted)
            }
            StreamEnd::Errored(error) => {
                if let Err(store_error) = self.record_failure(conversation_id, message_id, &error) {
                    warn!(
                        error = %store_error,
                        conversation_id,
                        "failed to record generation error"
                    );
                }
                self.clear_generating(conversation_id);
                self.transition(
                    ticket,
                    SendPhase::Errored {
                        conversation_id: conversation_id.to_string(),
                        error: error.clone(),
                    },
                );
                Ok(SendOutcome::Errored(error))
            }
        }
    }

    fn clear_generating(&self, conversation_id: &str) {
        if let Err(error) = self.registry.clear(conversation_id) {
            warn!(%error, conversation_id, "failed to clear generating entry");
        }
    }

    fn stop_streaming_if_present(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), ChatStateError> {
        match self
            .conversations
            .update_message(conversation_id, message_id, |message| {
                message.is_streaming = false;
            }) {
            Ok(_) => Ok(()),
            // A superseding send may already have removed it.
            Err(
                ChatStateError::UnknownMessage { .. } | ChatStateError::UnknownConversation { .. },
            ) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Drop an empty placeholder, settle a partial one and append the error.
    fn record_failure(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        error: &str,
    ) -> Result<(), ChatStateError> {
        let notice = Message::assistant(format!("Error: {error}"));
        self.conversations
            .update_conversation(conversation_id, |conversation| {
                if let Some(message_id) = message_id {
                    conversation.messages.retain_mut(|message| {
                        if message.id != message_id {
                            return true;
                        }
                        message.is_streaming = false;
                        !(message.content.is_empty() && message.tool_uses.is_empty())
                    });
                }
                conversation.messages.push(notice);
            })?;
        Ok(())
    }

    fn build_request(&self, conversation: &Conversation) -> GenerationRequest {
        let global = self.settings.load();
        let messages = conversation
            .messages
            .iter()
            .filter(|message| !message.is_streaming && !message.content.trim().is_empty())
            .map(|message| WireMessage::new(message.role.as_str(), message.content.clone()))
            .collect();

        let mut settings = conversation
            .settings
            .clone()
            .unwrap_or_else(|| global.settings.clone());
        if settings.agent.is_none() {
            settings.agent = conversation.agent_id.clone();
        }

        GenerationRequest {
            messages,
            backend: conversation.backend.clone().unwrap_or(global.backend),
            model: conversation.model.clone().unwrap_or(global.model),
            conversation_id: conversation.id.clone(),
            settings,
            cwd: conversation.cwd.clone(),
            session_id: conversation.session_id.clone(),
        }
    }

    fn begin_send(&self, conversation_id: &str) -> SendTicket {
        let send_id = self.next_send_id.fetch_add(1, Ordering::SeqCst);
        let cancel: CancellationSignal = Arc::new(AtomicBool::new(false));
        {
            let mut in_flight = self.lock_in_flight();
            if let Some(previous) = in_flight.take() {
                info!(
                    previous = %previous.conversation_id,
                    "superseding in-flight stream"
                );
                previous.cancel.store(true, Ordering::Release);
            }
            *in_flight = Some(InFlight {
                send_id,
                conversation_id: conversation_id.to_string(),
                cancel: Arc::clone(&cancel),
            });
        }

        let ticket = SendTicket {
            send_id,
            conversation_id: conversation_id.to_string(),
            cancel,
        };
        self.transition(
            &ticket,
            SendPhase::Sending {
                conversation_id: conversation_id.to_string(),
            },
        );
        ticket
    }

    fn finish_send(&self, ticket: &SendTicket, outcome: &Result<SendOutcome, LifecycleError>) {
        // Failures before the request went out never reach `end_send`.
        if let Err(error) = outcome {
            self.transition(
                ticket,
                SendPhase::Errored {
                    conversation_id: ticket.conversation_id.clone(),
                    error: error.to_string(),
                },
            );
        }
        let mut in_flight = self.lock_in_flight();
        if in_flight
            .as_ref()
            .is_some_and(|current| current.send_id == ticket.send_id)
        {
            *in_flight = None;
        }
    }

    /// Publish `next` if `ticket` still owns the phase and the step is legal.
    fn transition(&self, ticket: &SendTicket, next: SendPhase) {
        let owns_phase = self
            .lock_in_flight()
            .as_ref()
            .is_some_and(|current| current.send_id == ticket.send_id);
        if !owns_phase {
            debug!(send_id = ticket.send_id, ?next, "stale send; phase not published");
            return;
        }
        self.phase.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                warn!(from = ?current, to = ?next, "rejected send phase transition");
                return false;
            }
            *current = next;
            true
        });
    }

    fn require_conversation(&self, conversation_id: &str) -> Result<Conversation, LifecycleError> {
        self.conversations
            .get(conversation_id)
            .ok_or_else(|| LifecycleError::UnknownConversation {
                id: conversation_id.to_string(),
            })
    }

    fn set_active(&self, conversation_id: Option<String>) {
        self.active.send_if_modified(|current| {
            if *current == conversation_id {
                return false;
            }
            *current = conversation_id;
            true
        });
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn is_cancelled(cancel: &CancellationSignal) -> bool {
    cancel.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_api::{ByteStream, CancellationSignal, ChatApiError, GenerationRequest, Transcript};
    use chat_state::{
        ConversationStore, GeneratingRegistry, KeyValueStore, MemoryStore, Message, Role,
        SettingsStore,
    };

    use super::ConversationLifecycle;
    use crate::backend::ChatBackend;

    struct UnreachableBackend;

    #[async_trait::async_trait]
    impl ChatBackend for UnreachableBackend {
        async fn open_stream(
            &self,
            _request: &GenerationRequest,
            _cancellation: Option<&CancellationSignal>,
        ) -> Result<ByteStream, ChatApiError> {
            Err(ChatApiError::MissingBody)
        }

        async fn fetch_transcript(&self, _id: &str) -> Result<Transcript, ChatApiError> {
            Ok(Transcript::default())
        }
    }

    fn lifecycle() -> ConversationLifecycle {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        ConversationLifecycle::new(
            Arc::new(UnreachableBackend),
            Arc::new(ConversationStore::new(Arc::clone(&store))),
            Arc::new(GeneratingRegistry::new(Arc::clone(&store))),
            SettingsStore::new(store),
        )
    }

    #[test]
    fn request_carries_history_and_snapshot() {
        let lifecycle = lifecycle();
        let id = lifecycle.new_conversation().expect("create");
        lifecycle
            .conversations
            .update_conversation(&id, |conversation| {
                conversation.model = Some("opus".to_string());
                conversation.session_id = Some("s-1".to_string());
                conversation.messages.push(Message::user("hi"));
                conversation.messages.push(Message::assistant(""));
                let mut partial = Message::assistant("partial");
                partial.is_streaming = true;
                conversation.messages.push(partial);
            })
            .expect("update");

        let conversation = lifecycle.conversations.get(&id).expect("conversation");
        let request = lifecycle.build_request(&conversation);
        assert_eq!(request.model, "opus");
        assert_eq!(request.backend, "claude");
        assert_eq!(request.session_id.as_deref(), Some("s-1"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User.as_str());
    }

    #[test]
    fn select_rejects_unknown_conversation() {
        let lifecycle = lifecycle();
        assert!(lifecycle.select("missing").is_err());
        let id = lifecycle.new_conversation().expect("create");
        assert_eq!(lifecycle.active_conversation(), Some(id));
    }

    #[test]
    fn abort_without_stream_is_a_no_op() {
        let lifecycle = lifecycle();
        assert!(!lifecycle.abort());
    }
}
