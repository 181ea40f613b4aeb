//! Scripted endpoint for tests and offline runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CompletionEndpoint, CompletionRequest, FragmentStream};
use crate::error::DispatchError;

const CANNED_REPLY: &str = "This is a mock response from Puffin. No model was called.";

/// One scripted reply.
#[derive(Debug, Clone)]
enum Reply {
    Fragments(Vec<String>),
    /// Fail before any fragment is produced.
    OpenFailure(String),
    /// Produce these fragments, then fail mid-stream.
    FailAfter(Vec<String>, String),
}

/// Replays queued replies in order and records every request it receives.
///
/// When the queue is empty it streams a canned sentence word by word.
#[derive(Debug, Default)]
pub struct MockEndpoint {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose first reply streams `fragments`.
    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        mock.queue_fragments(fragments);
        mock
    }

    pub fn queue_fragments<I, S>(&self, fragments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Reply::Fragments(fragments.into_iter().map(Into::into).collect()));
    }

    pub fn queue_failure(&self, message: impl Into<String>) {
        self.push(Reply::OpenFailure(message.into()));
    }

    pub fn queue_failure_after<I, S>(&self, fragments: I, message: impl Into<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Reply::FailAfter(
            fragments.into_iter().map(Into::into).collect(),
            message.into(),
        ));
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn push(&self, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    fn next_reply(&self) -> Reply {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Reply::Fragments(
                    CANNED_REPLY
                        .split_inclusive(' ')
                        .map(str::to_string)
                        .collect(),
                )
            })
    }
}

#[async_trait]
impl CompletionEndpoint for MockEndpoint {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream, DispatchError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let items: Vec<Result<String, DispatchError>> = match self.next_reply() {
            Reply::Fragments(fragments) => fragments.into_iter().map(Ok).collect(),
            Reply::OpenFailure(message) => {
                return Err(DispatchError::ApiRequest { message });
            }
            Reply::FailAfter(fragments, message) => fragments
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(DispatchError::Streaming { message })))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
