use chat_state::ChatStateError;
use thiserror::Error;

/// Precondition failures of lifecycle operations.
///
/// Stream and transport failures never surface here; they are reported
/// through [`SendOutcome::Errored`] after being recorded in the conversation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("message is empty")]
    EmptyPrompt,

    #[error("no conversation is active")]
    NoActiveConversation,

    #[error("conversation '{id}' has no user message to regenerate from")]
    NothingToRegenerate { id: String },

    #[error("unknown conversation '{id}'")]
    UnknownConversation { id: String },

    #[error(transparent)]
    State(#[from] ChatStateError),
}

/// How a send ended once the request had been issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Terminal marker observed; the registry entry is gone.
    Completed,
    /// Local cancellation; the registry entry was left in place.
    Aborted,
    /// Any other failure; an error message was appended.
    Errored(String),
}

impl SendOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Result of one reconciliation attempt. None of these are shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A newer server message was appended and the registry entry cleared.
    Synced,
    /// Nothing newer on the server, or nothing to compare against.
    NotSynced,
    /// The transcript could not be fetched.
    TransientFailure,
}

/// Failures while assembling an engine from configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Api(#[from] chat_api::ChatApiError),

    #[error(transparent)]
    State(#[from] ChatStateError),
}
