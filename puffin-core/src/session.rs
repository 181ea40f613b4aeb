//! Session state and turn-taking.
//!
//! A [`Session`] exclusively owns one conversation together with its status
//! (`Idle → AwaitingResponse → Streaming → Idle`, or `→ Aborted`). A turn aborted
//! by the token guard only leaves `Aborted` through [`Session::reset_conversation`].
//! A turn aborted by a failed dispatch can also be retried, which re-dispatches the
//! same user turn.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, Message};
use crate::error::ConversationError;

/// Where a conversation is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    AwaitingResponse,
    Streaming,
    Aborted,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationStatus::Idle => write!(f, "idle"),
            ConversationStatus::AwaitingResponse => write!(f, "awaiting response"),
            ConversationStatus::Streaming => write!(f, "streaming"),
            ConversationStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// The kind of user turn waiting for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Code or requirements to act on with the selected options.
    Task,
    /// A follow-up question about the previous answer.
    FollowUp,
}

/// A canned follow-up action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUp {
    pub label: &'static str,
    pub prompt: &'static str,
}

pub const CREATE_UNIT_TEST: FollowUp = FollowUp {
    label: "Create Unit Test",
    prompt: "Create Unit Test",
};

pub const HOW_TO_USE: FollowUp = FollowUp {
    label: "How to use",
    prompt: "Show me step by step and with examples how to use the provided code and how to implement it",
};

/// Why the session entered `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortCause {
    TooLong,
    DispatchFailed(TurnKind),
}

/// One user's conversation and where it stands.
#[derive(Debug, Clone)]
pub struct Session {
    conversation: Conversation,
    status: ConversationStatus,
    pending: Option<TurnKind>,
    aborted_by: Option<AbortCause>,
}

impl Session {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            conversation: Conversation::new(greeting),
            status: ConversationStatus::Idle,
            pending: None,
            aborted_by: None,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn pending_turn(&self) -> Option<TurnKind> {
        self.pending
    }

    pub fn is_aborted(&self) -> bool {
        self.status == ConversationStatus::Aborted
    }

    /// True when the last turn was aborted by a failed dispatch and can be re-sent.
    pub fn can_retry(&self) -> bool {
        matches!(self.aborted_by, Some(AbortCause::DispatchFailed(_)))
    }

    /// True iff the conversation is non-empty and its last message is not from the assistant.
    pub fn needs_response(&self) -> bool {
        self.conversation.needs_response()
    }

    /// Append user code or requirements as a new turn.
    ///
    /// Blank input is rejected without touching the conversation.
    pub fn append_user_turn(&mut self, content: &str) -> Result<(), ConversationError> {
        self.push_user(content.to_string(), TurnKind::Task)
    }

    /// Append a follow-up as a user turn, formatted as a bullet (`"\n - {text}"`).
    pub fn append_follow_up(&mut self, label: &str, text: &str) -> Result<(), ConversationError> {
        if text.trim().is_empty() {
            return Err(ConversationError::EmptyInput);
        }
        debug!(label, "Queueing follow-up");
        self.push_user(format!("\n - {}", text), TurnKind::FollowUp)
    }

    fn push_user(&mut self, content: String, kind: TurnKind) -> Result<(), ConversationError> {
        if content.trim().is_empty() {
            return Err(ConversationError::EmptyInput);
        }
        match self.status {
            ConversationStatus::Aborted => return Err(ConversationError::Aborted),
            ConversationStatus::Streaming => {
                return Err(self.invalid_transition(ConversationStatus::AwaitingResponse));
            }
            ConversationStatus::Idle | ConversationStatus::AwaitingResponse => {}
        }
        self.conversation.push_user(content);
        self.pending = Some(kind);
        self.status = ConversationStatus::AwaitingResponse;
        Ok(())
    }

    /// Truncate the conversation to its greeting and return to `Idle`.
    pub fn reset_conversation(&mut self) {
        info!(
            previous_len = self.conversation.len(),
            status = %self.status,
            "Resetting conversation"
        );
        self.conversation.reset();
        self.pending = None;
        self.aborted_by = None;
        self.status = ConversationStatus::Idle;
    }

    /// Check that a response can be generated now and return the pending turn kind.
    ///
    /// After a failed dispatch the same turn is re-armed: any partial output from
    /// the failed attempt is dropped and the session returns to `AwaitingResponse`.
    pub(crate) fn ready_for_response(&mut self) -> Result<TurnKind, ConversationError> {
        if let Some(AbortCause::DispatchFailed(kind)) = self.aborted_by {
            if self.conversation.discard_trailing_assistant() {
                debug!("Discarded partial output of the failed attempt");
            }
            info!(turn = ?kind, "Retrying failed turn");
            self.aborted_by = None;
            self.pending = Some(kind);
            self.status = ConversationStatus::AwaitingResponse;
        }
        match self.status {
            ConversationStatus::Aborted => Err(ConversationError::Aborted),
            ConversationStatus::Streaming => {
                Err(self.invalid_transition(ConversationStatus::Streaming))
            }
            _ if !self.needs_response() => Err(ConversationError::NothingToRespond),
            _ => Ok(self.pending.unwrap_or(TurnKind::Task)),
        }
    }

    /// Enter `Streaming` and open the assistant turn fragments are appended to.
    pub(crate) fn begin_streaming(&mut self) {
        self.conversation.begin_assistant_turn();
        self.pending = None;
        self.status = ConversationStatus::Streaming;
    }

    pub(crate) fn append_fragment(&mut self, fragment: &str) {
        self.conversation.append_to_assistant(fragment);
    }

    /// Leave `Streaming` after the stream closed or was abandoned.
    pub(crate) fn finish_streaming(&mut self) {
        if self.status == ConversationStatus::Streaming {
            self.status = ConversationStatus::Idle;
        }
    }

    /// Abort the pending turn, writing `message` into the trailing assistant message.
    ///
    /// Only [`Session::reset_conversation`] leaves this state.
    pub fn abort(&mut self, message: &str) {
        warn!(error = message, "Aborting conversation turn");
        self.conversation.replace_trailing_assistant(message);
        self.pending = None;
        self.aborted_by = Some(AbortCause::TooLong);
        self.status = ConversationStatus::Aborted;
    }

    /// Abort after the endpoint failed, keeping any partial output until a retry.
    pub(crate) fn mark_dispatch_failed(&mut self, kind: TurnKind) {
        self.pending = None;
        self.aborted_by = Some(AbortCause::DispatchFailed(kind));
        self.status = ConversationStatus::Aborted;
    }

    fn invalid_transition(&self, to: ConversationStatus) -> ConversationError {
        ConversationError::InvalidStateTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(crate::conversation::DEFAULT_GREETING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    #[test]
    fn test_append_user_turn_moves_to_awaiting() {
        let mut session = Session::default();
        session.append_user_turn("def f(x): return x+1").unwrap();
        assert_eq!(session.status(), ConversationStatus::AwaitingResponse);
        assert_eq!(session.pending_turn(), Some(TurnKind::Task));
        assert!(session.needs_response());
    }

    #[test]
    fn test_blank_input_rejected_without_mutation() {
        let mut session = Session::default();
        let err = session.append_user_turn("  \n\t").unwrap_err();
        assert!(matches!(err, ConversationError::EmptyInput));
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.status(), ConversationStatus::Idle);

        let err = session.append_follow_up("Send", "   ").unwrap_err();
        assert!(matches!(err, ConversationError::EmptyInput));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn test_follow_up_format() {
        let mut session = Session::default();
        session
            .append_follow_up(CREATE_UNIT_TEST.label, CREATE_UNIT_TEST.prompt)
            .unwrap();
        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "\n - Create Unit Test");
        assert_eq!(session.pending_turn(), Some(TurnKind::FollowUp));
    }

    #[test]
    fn test_abort_requires_reset() {
        let mut session = Session::default();
        session.append_user_turn("code").unwrap();
        session.abort("too long");
        assert!(session.is_aborted());
        assert_eq!(session.messages().last().unwrap().content, "too long");
        assert_eq!(session.messages().last().unwrap().role, Role::Assistant);

        let err = session.append_user_turn("more").unwrap_err();
        assert!(matches!(err, ConversationError::Aborted));
        assert!(matches!(
            session.ready_for_response().unwrap_err(),
            ConversationError::Aborted
        ));

        assert!(!session.can_retry());

        session.reset_conversation();
        assert_eq!(session.status(), ConversationStatus::Idle);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::Assistant);
    }

    #[test]
    fn test_failed_dispatch_rearms_turn() {
        let mut session = Session::default();
        session.append_user_turn("code").unwrap();
        session.append_follow_up("Send", "why?").unwrap();
        let kind = session.ready_for_response().unwrap();
        session.begin_streaming();
        session.append_fragment("Because");
        session.mark_dispatch_failed(kind);

        assert!(session.is_aborted());
        assert!(session.can_retry());
        assert_eq!(session.messages().last().unwrap().content, "Because");
        assert!(matches!(
            session.append_user_turn("more").unwrap_err(),
            ConversationError::Aborted
        ));

        assert_eq!(session.ready_for_response().unwrap(), TurnKind::FollowUp);
        assert_eq!(session.status(), ConversationStatus::AwaitingResponse);
        assert!(!session.can_retry());
        assert_eq!(session.messages().len(), 3);
        assert_eq!(session.messages().last().unwrap().content, "\n - why?");
    }

    #[test]
    fn test_follow_up_text_kept_verbatim() {
        let mut session = Session::default();
        session.append_follow_up("Send", "  keep spacing ").unwrap();
        assert_eq!(session.messages().last().unwrap().content, "\n -   keep spacing ");
    }

    #[test]
    fn test_streaming_cycle() {
        let mut session = Session::default();
        session.append_user_turn("code").unwrap();
        assert_eq!(session.ready_for_response().unwrap(), TurnKind::Task);

        session.begin_streaming();
        assert_eq!(session.status(), ConversationStatus::Streaming);
        assert!(matches!(
            session.append_user_turn("again").unwrap_err(),
            ConversationError::InvalidStateTransition { .. }
        ));

        session.append_fragment("Hel");
        session.append_fragment("lo");
        session.finish_streaming();
        assert_eq!(session.status(), ConversationStatus::Idle);
        assert_eq!(session.messages().last().unwrap().content, "Hello");
        assert!(!session.needs_response());
    }

    #[test]
    fn test_nothing_to_respond() {
        let mut session = Session::default();
        assert!(matches!(
            session.ready_for_response().unwrap_err(),
            ConversationError::NothingToRespond
        ));
    }
}
