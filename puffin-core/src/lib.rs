//! # Puffin Core
//!
//! Core library for Puffin, a chat assistant that refactors, writes, and
//! reviews code through a hosted language model.
//! Provides the conversation state machine, prompt builder, token guard,
//! streaming endpoints, credentials, and configuration.

pub mod config;
pub mod conversation;
pub mod credentials;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod prompt;
pub mod session;
pub mod tokenizer;

// Re-export commonly used types at the crate root.
pub use config::{ConfigOverrides, EndpointConfig, PuffinConfig, load_config};
pub use conversation::{Conversation, DEFAULT_GREETING, Message, Role};
pub use credentials::{CredentialStore, InMemoryCredentialStore, KeyringCredentialStore};
pub use dispatcher::{ConversationController, Dispatcher, Relay};
pub use endpoint::{CompletionEndpoint, CompletionRequest, FragmentStream, MockEndpoint};
pub use error::{
    ConfigError, ConversationError, CredentialError, DispatchError, PuffinError, Result,
};
pub use options::{Functionality, ModelParameters, RefactorMenu, RefactorOptions};
pub use session::{CREATE_UNIT_TEST, ConversationStatus, FollowUp, HOW_TO_USE, Session, TurnKind};
pub use tokenizer::{BpeTokenizer, TokenBudget, TokenGuard, Tokenizer};
