//! Error types for the Puffin core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the conversation, dispatch, configuration, and credential domains.

use std::path::PathBuf;

pub use crate::credentials::CredentialError;

/// Top-level error type for the Puffin core library.
#[derive(Debug, thiserror::Error)]
pub enum PuffinError {
    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PuffinError {
    /// Whether the session was aborted by the token guard and only a reset recovers it.
    ///
    /// Dispatch failures leave the turn retryable; see `Session::can_retry`.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            PuffinError::Conversation(ConversationError::TooLong { .. })
        )
    }
}

/// Errors raised by the conversation controller and the token guard.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Conversation length too long: {used} tokens, budget is {limit}")]
    TooLong { used: usize, limit: usize },

    #[error("Input is empty")]
    EmptyInput,

    #[error("Conversation was aborted; retry or reset it before continuing")]
    Aborted,

    #[error("No pending user turn to respond to")]
    NothingToRespond,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

/// Errors from the streaming completion endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Value out of range for {field}: {value} (expected {min}..={max})")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Unknown {kind}: {value}")]
    UnknownValue { kind: String, value: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `PuffinError`.
pub type Result<T> = std::result::Result<T, PuffinError>;
