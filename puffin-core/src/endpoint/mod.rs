//! Streaming completion endpoints.
//!
//! Defines the [`CompletionEndpoint`] trait the dispatcher talks to, the
//! Replicate implementation used in production, and a scripted mock.

pub mod mock;
pub mod replicate;
pub mod sse;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::credentials::{CredentialStore, resolve_api_token};
use crate::error::{ConfigError, PuffinError};
use crate::options::ModelParameters;

pub use crate::error::DispatchError;
pub use mock::MockEndpoint;
pub use replicate::ReplicateEndpoint;

/// Fragments of model output in arrival order. Ends when the endpoint closes the stream.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, DispatchError>> + Send>>;

/// The input of one streaming completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f64,
    pub top_p: f64,
    /// Template the endpoint wraps the prompt in; `"{prompt}"` stops it from adding its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

impl CompletionRequest {
    pub fn new(
        prompt: impl Into<String>,
        params: ModelParameters,
        prompt_template: Option<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: params.temperature,
            top_p: params.top_p,
            prompt_template,
        }
    }
}

/// A hosted model that streams text fragments for a prompt.
#[async_trait]
pub trait CompletionEndpoint: Send + Sync {
    /// Open a streaming completion. Errors here mean nothing was generated.
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream, DispatchError>;

    /// Provider/model label used in logs.
    fn name(&self) -> &str;
}

/// Build the endpoint named by `config.provider`.
///
/// Resolving the API token happens here, so a missing credential fails setup
/// before any conversation starts.
pub fn from_config(
    config: &EndpointConfig,
    store: Option<&dyn CredentialStore>,
) -> Result<Arc<dyn CompletionEndpoint>, PuffinError> {
    match config.provider.as_str() {
        "replicate" => {
            let token = resolve_api_token(config, store)?;
            Ok(Arc::new(ReplicateEndpoint::new(config, token)?))
        }
        "mock" => Ok(Arc::new(MockEndpoint::new())),
        other => Err(ConfigError::UnknownValue {
            kind: "provider".to_string(),
            value: other.to_string(),
        }
        .into()),
    }
}
