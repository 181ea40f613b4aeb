//! Conversation state: an ordered, never-empty list of role-tagged messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The greeting every conversation starts with unless configured otherwise.
pub const DEFAULT_GREETING: &str = "Hi. I'm Puffin, how can I help you today?";

/// Represents a participant role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message with auto-generated ID and current timestamp.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered conversation history, seeded with an assistant greeting.
///
/// Only the trailing assistant message is ever rewritten; everything before it
/// is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    greeting: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(greeting: impl Into<String>) -> Self {
        let greeting = greeting.into();
        Self {
            messages: vec![Message::assistant(greeting.clone())],
            greeting,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// True when the last message is not from the assistant.
    pub fn needs_response(&self) -> bool {
        needs_response(&self.messages)
    }

    /// Truncate to the single greeting message.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.messages.push(Message::assistant(self.greeting.clone()));
    }

    pub(crate) fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Open an empty assistant turn for streaming into.
    pub(crate) fn begin_assistant_turn(&mut self) {
        self.messages.push(Message::assistant(String::new()));
    }

    /// Append a streamed fragment to the trailing assistant message, opening one
    /// if the conversation does not end with an assistant turn.
    pub(crate) fn append_to_assistant(&mut self, fragment: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content.push_str(fragment),
            _ => self.messages.push(Message::assistant(fragment)),
        }
    }

    /// Replace the trailing assistant message wholesale, or append one.
    pub(crate) fn replace_trailing_assistant(&mut self, content: impl Into<String>) {
        let content = content.into();
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content = content,
            _ => self.messages.push(Message::assistant(content)),
        }
    }

    /// Drop a trailing assistant message that answers a user turn. The greeting
    /// is never removed. Returns whether a message was dropped.
    pub(crate) fn discard_trailing_assistant(&mut self) -> bool {
        let n = self.messages.len();
        if n >= 2
            && self.messages[n - 1].role == Role::Assistant
            && self.messages[n - 2].role == Role::User
        {
            self.messages.pop();
            true
        } else {
            false
        }
    }

    /// All assistant messages in order, numbered from 1.
    pub fn previous_responses(&self) -> impl Iterator<Item = (usize, &Message)> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .enumerate()
            .map(|(i, m)| (i + 1, m))
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(DEFAULT_GREETING)
    }
}

/// True iff `messages` is non-empty and its last role is not `assistant`.
pub fn needs_response(messages: &[Message]) -> bool {
    messages.last().is_some_and(|m| m.role != Role::Assistant)
}
