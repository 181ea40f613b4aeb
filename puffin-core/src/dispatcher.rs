//! Prompt dispatch and the streaming relay.
//!
//! [`Dispatcher`] turns the pending turn of a [`Session`] into a prompt, runs the
//! token guard, and opens a streaming completion. The returned [`Relay`] borrows
//! the session mutably for as long as the stream is alive and writes every
//! fragment into the trailing assistant message before yielding it.
//!
//! [`ConversationController`] bundles a session with a dispatcher and the
//! currently selected options.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::config::PuffinConfig;
use crate::credentials::CredentialStore;
use crate::endpoint::{self, CompletionEndpoint, CompletionRequest, FragmentStream};
use crate::error::{DispatchError, PuffinError};
use crate::options::{Functionality, ModelParameters, RefactorMenu, RefactorOptions};
use crate::prompt;
use crate::session::{FollowUp, Session, TurnKind};
use crate::tokenizer::{BpeTokenizer, TokenGuard};

/// Builds prompts, enforces the token budget, and opens streaming completions.
pub struct Dispatcher {
    endpoint: Arc<dyn CompletionEndpoint>,
    guard: TokenGuard,
    params: ModelParameters,
    prompt_template: Option<String>,
}

impl Dispatcher {
    pub fn new(
        endpoint: Arc<dyn CompletionEndpoint>,
        guard: TokenGuard,
        params: ModelParameters,
        prompt_template: Option<String>,
    ) -> Result<Self, PuffinError> {
        params.validate()?;
        Ok(Self {
            endpoint,
            guard,
            params,
            prompt_template,
        })
    }

    pub fn endpoint(&self) -> &Arc<dyn CompletionEndpoint> {
        &self.endpoint
    }

    pub fn guard(&self) -> &TokenGuard {
        &self.guard
    }

    pub fn params(&self) -> ModelParameters {
        self.params
    }

    pub fn set_params(&mut self, params: ModelParameters) -> Result<(), PuffinError> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// Generate a response for the session's pending user turn.
    ///
    /// If the assembled prompt reaches the token budget, the session is aborted
    /// with a visible error message and the endpoint is never called. If the
    /// endpoint cannot be opened, the session is aborted and the error returned;
    /// calling `dispatch` again retries the same turn.
    pub async fn dispatch<'s>(
        &self,
        session: &'s mut Session,
        options: &RefactorOptions,
        functionality: Functionality,
    ) -> Result<Relay<'s>, PuffinError> {
        let kind = session.ready_for_response()?;
        let prompt = prompt::build_for_turn(kind, session.messages(), options, functionality);
        debug!(
            turn = ?kind,
            functionality = %functionality,
            prompt_chars = prompt.len(),
            "Assembled prompt"
        );

        let tokens = match self.guard.check(&prompt) {
            Ok(tokens) => tokens,
            Err(err) => {
                session.abort(&self.guard.abort_message());
                return Err(err.into());
            }
        };

        let request = CompletionRequest::new(prompt, self.params, self.prompt_template.clone());
        info!(
            endpoint = self.endpoint.name(),
            tokens,
            budget = self.guard.budget().limit(),
            temperature = self.params.temperature,
            top_p = self.params.top_p,
            "Dispatching prompt"
        );

        let fragments = match self.endpoint.stream(request).await {
            Ok(fragments) => fragments,
            Err(err) => {
                error!(endpoint = self.endpoint.name(), error = %err, "Failed to open completion stream");
                session.mark_dispatch_failed(kind);
                return Err(err.into());
            }
        };

        session.begin_streaming();
        Ok(Relay::new(session, fragments, kind))
    }
}

/// Forward-only stream of response fragments for one turn.
///
/// Each fragment is appended to the trailing assistant message before it is
/// yielded. When the endpoint closes the stream the session returns to `Idle`;
/// when it fails the session is aborted and the partial output stays in place
/// until the turn is retried. Dropping the relay early ends the turn with
/// whatever was received.
pub struct Relay<'s> {
    session: &'s mut Session,
    fragments: FragmentStream,
    kind: TurnKind,
    received: usize,
    started: Instant,
    done: bool,
}

impl<'s> Relay<'s> {
    fn new(session: &'s mut Session, fragments: FragmentStream, kind: TurnKind) -> Self {
        Self {
            session,
            fragments,
            kind,
            received: 0,
            started: Instant::now(),
            done: false,
        }
    }

    /// Number of fragments relayed so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Drain the stream and return the concatenated response text.
    pub async fn collect_text(mut self) -> Result<String, DispatchError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for Relay<'_> {
    type Item = Result<String, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.fragments.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(fragment))) => {
                this.session.append_fragment(&fragment);
                this.received += 1;
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(err))) => {
                error!(
                    error = %err,
                    fragments = this.received,
                    "Completion stream failed"
                );
                this.done = true;
                this.session.mark_dispatch_failed(this.kind);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                info!(
                    fragments = this.received,
                    elapsed_ms = this.started.elapsed().as_millis() as u64,
                    "Response complete"
                );
                this.done = true;
                this.session.finish_streaming();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Relay<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!(fragments = self.received, "Relay dropped before the stream ended");
            self.session.finish_streaming();
        }
    }
}

/// A session together with everything needed to answer it.
pub struct ConversationController {
    session: Session,
    dispatcher: Dispatcher,
    options: RefactorOptions,
    functionality: Functionality,
}

impl ConversationController {
    pub fn new(
        session: Session,
        dispatcher: Dispatcher,
        options: RefactorOptions,
        functionality: Functionality,
    ) -> Self {
        Self {
            session,
            dispatcher,
            options,
            functionality,
        }
    }

    /// Build a controller from configuration, resolving the endpoint and tokenizer.
    ///
    /// Fails up front when no API token can be found for the configured provider.
    pub fn from_config(
        config: &PuffinConfig,
        store: Option<&dyn CredentialStore>,
    ) -> Result<Self, PuffinError> {
        config.validate()?;
        let endpoint = endpoint::from_config(&config.endpoint, store)?;
        Self::with_endpoint(config, endpoint)
    }

    /// Build a controller from configuration around an already constructed endpoint.
    pub fn with_endpoint(
        config: &PuffinConfig,
        endpoint: Arc<dyn CompletionEndpoint>,
    ) -> Result<Self, PuffinError> {
        config.validate()?;
        let tokenizer = BpeTokenizer::resolve(&config.session.tokenizer)?;
        let guard = TokenGuard::new(tokenizer, config.session.token_budget);
        let dispatcher = Dispatcher::new(
            endpoint,
            guard,
            config.model,
            config.endpoint.prompt_template.clone(),
        )?;

        let menu = config.options.load_menu()?;
        let functionality = config.options.functionality;
        let options = match config.options.programming_language.as_deref() {
            Some(language) => RefactorOptions::defaults_for(language, functionality, &menu),
            None => RefactorOptions::default(),
        };
        options.validate(&menu)?;

        Ok(Self::new(
            Session::new(config.session.greeting.clone()),
            dispatcher,
            options,
            functionality,
        ))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn options(&self) -> &RefactorOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RefactorOptions) {
        self.options = options;
    }

    /// Replace the options after checking them against a catalog.
    pub fn set_options_checked(
        &mut self,
        options: RefactorOptions,
        menu: &RefactorMenu,
    ) -> Result<(), PuffinError> {
        options.validate(menu)?;
        self.options = options;
        Ok(())
    }

    pub fn functionality(&self) -> Functionality {
        self.functionality
    }

    pub fn set_functionality(&mut self, functionality: Functionality) {
        self.functionality = functionality;
    }

    pub fn params(&self) -> ModelParameters {
        self.dispatcher.params()
    }

    pub fn set_params(&mut self, params: ModelParameters) -> Result<(), PuffinError> {
        self.dispatcher.set_params(params)
    }

    pub fn append_user_turn(&mut self, content: &str) -> Result<(), PuffinError> {
        Ok(self.session.append_user_turn(content)?)
    }

    pub fn needs_response(&self) -> bool {
        self.session.needs_response()
    }

    pub fn reset_conversation(&mut self) {
        self.session.reset_conversation();
    }

    /// Stream the response to the pending user turn.
    pub async fn respond(&mut self) -> Result<Relay<'_>, PuffinError> {
        self.dispatcher
            .dispatch(&mut self.session, &self.options, self.functionality)
            .await
    }

    /// Append a follow-up and immediately stream its response.
    pub async fn request_follow_up(
        &mut self,
        label: &str,
        text: &str,
    ) -> Result<Relay<'_>, PuffinError> {
        self.session.append_follow_up(label, text)?;
        self.respond().await
    }

    /// Run one of the canned follow-up actions.
    pub async fn follow_up(&mut self, action: FollowUp) -> Result<Relay<'_>, PuffinError> {
        self.request_follow_up(action.label, action.prompt).await
    }
}
