/// Per-send state published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    /// User message recorded; the request has not been issued yet.
    Sending { conversation_id: String },
    /// Request in flight, no response yet.
    AwaitingFirstToken { conversation_id: String },
    Streaming {
        conversation_id: String,
        message_id: String,
    },
    Completed { conversation_id: String },
    Aborted { conversation_id: String },
    Errored {
        conversation_id: String,
        error: String,
    },
}

impl SendPhase {
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Sending { conversation_id }
            | Self::AwaitingFirstToken { conversation_id }
            | Self::Streaming {
                conversation_id, ..
            }
            | Self::Completed { conversation_id }
            | Self::Aborted { conversation_id }
            | Self::Errored {
                conversation_id, ..
            } => Some(conversation_id),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Aborted { .. } | Self::Errored { .. }
        )
    }

    /// Whether a send is between issuing its request and a terminal state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }

    /// Whether `next` may follow `self` within one send.
    ///
    /// `Sending` always starts a new send and is accepted from any phase.
    #[must_use]
    pub fn can_transition_to(&self, next: &SendPhase) -> bool {
        if matches!(next, Self::Sending { .. }) {
            return true;
        }
        if self.conversation_id() != next.conversation_id() {
            return false;
        }
        match (self, next) {
            (Self::Sending { .. }, Self::AwaitingFirstToken { .. }) => true,
            (Self::AwaitingFirstToken { .. }, Self::Streaming { .. }) => true,
            (Self::Streaming { .. }, Self::Completed { .. }) => true,
            (
                Self::Sending { .. } | Self::AwaitingFirstToken { .. } | Self::Streaming { .. },
                Self::Aborted { .. } | Self::Errored { .. },
            ) => true,
            _ => false,
        }
    }
}
