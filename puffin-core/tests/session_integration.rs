//! Integration tests for a Puffin session.
//!
//! These drive the controller end-to-end against the scripted MockEndpoint:
//! append a turn, stream the response, follow up, trip the guard, and reset.

use futures::StreamExt;
use puffin_core::config::{ConfigOverrides, EndpointOverrides, PuffinConfig};
use puffin_core::dispatcher::{ConversationController, Dispatcher};
use puffin_core::endpoint::MockEndpoint;
use puffin_core::error::{ConversationError, DispatchError, PuffinError};
use puffin_core::options::{Functionality, ModelParameters, RefactorMenu, RefactorOptions};
use puffin_core::session::{ConversationStatus, HOW_TO_USE, Session};
use puffin_core::tokenizer::{BpeTokenizer, FixedTokenizer, TokenBudget, TokenGuard};
use puffin_core::{Role, load_config};
use std::sync::Arc;

fn python_options() -> RefactorOptions {
    RefactorOptions {
        programming_language: Some("Python".into()),
        optimize_for: vec!["Performance".into()],
        include_type_annotations: true,
        ..RefactorOptions::default()
    }
}

/// Controller with the real BPE tokenizer and the given budget.
fn bpe_controller(mock: Arc<MockEndpoint>, budget: usize) -> ConversationController {
    let tokenizer = BpeTokenizer::shared().unwrap();
    let guard = TokenGuard::new(tokenizer, TokenBudget::new(budget).unwrap());
    let dispatcher = Dispatcher::new(
        mock,
        guard,
        ModelParameters::default(),
        Some("{prompt}".into()),
    )
    .unwrap();
    ConversationController::new(
        Session::default(),
        dispatcher,
        python_options(),
        Functionality::Refactor,
    )
}

#[tokio::test]
async fn test_refactor_turn_end_to_end() {
    let mock = Arc::new(MockEndpoint::with_fragments([
        "```python\n",
        "def f(x: int) -> int:\n    return x + 1\n",
        "```",
    ]));
    let mut ctl = bpe_controller(mock.clone(), 3072);

    ctl.append_user_turn("def f(x): return x+1").unwrap();
    assert_eq!(ctl.session().status(), ConversationStatus::AwaitingResponse);

    let text = ctl.respond().await.unwrap().collect_text().await.unwrap();
    assert!(text.contains("-> int"));
    assert_eq!(ctl.session().status(), ConversationStatus::Idle);
    assert_eq!(ctl.session().messages().len(), 3);
    assert_eq!(ctl.session().messages()[2].content, text);

    let requests = mock.requests();
    let prompt = &requests[0].prompt;
    assert!(prompt.contains("```python\ndef f(x): return x+1\n```"));
    assert!(prompt.contains("- Optimize code for Performance"));
    assert!(prompt.contains("- Include type annotations"));
    assert!(!prompt.contains("docstring"));
}

#[tokio::test]
async fn test_fragments_observed_in_order_while_streaming() {
    let mock = Arc::new(MockEndpoint::with_fragments(["Hel", "lo"]));
    let mut ctl = bpe_controller(mock, 3072);
    ctl.append_user_turn("print('hi')").unwrap();

    let mut relay = ctl.respond().await.unwrap();
    let mut seen = Vec::new();
    while let Some(fragment) = relay.next().await {
        seen.push(fragment.unwrap());
    }
    drop(relay);

    assert_eq!(seen, vec!["Hel".to_string(), "lo".to_string()]);
    let last = ctl.session().messages().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Hello");
}

#[tokio::test]
async fn test_follow_up_after_response() {
    let mock = Arc::new(MockEndpoint::with_fragments(["refactored"]));
    mock.queue_fragments(["1. Import it", "\n2. Call it"]);
    let mut ctl = bpe_controller(mock.clone(), 3072);

    ctl.append_user_turn("def f(x): return x+1").unwrap();
    ctl.respond().await.unwrap().collect_text().await.unwrap();

    let text = ctl
        .follow_up(HOW_TO_USE)
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "1. Import it\n2. Call it");

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].prompt.contains("refactored"));
    assert!(!requests[1].prompt.contains("Apply the following criteria"));

    let responses: Vec<_> = ctl
        .session()
        .conversation()
        .previous_responses()
        .map(|(n, m)| (n, m.content.clone()))
        .collect();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2], (3, text));
}

#[tokio::test]
async fn test_over_budget_conversation_needs_reset() {
    let mock = Arc::new(MockEndpoint::new());
    let mut ctl = bpe_controller(mock.clone(), 512);

    let long_code = "x = compute(a, b, c)\n".repeat(500);
    ctl.append_user_turn(&long_code).unwrap();
    let err = ctl.respond().await.err().unwrap();
    assert!(matches!(
        err,
        PuffinError::Conversation(ConversationError::TooLong { limit: 512, .. })
    ));
    assert_eq!(mock.call_count(), 0);
    assert_eq!(ctl.session().status(), ConversationStatus::Aborted);
    assert_eq!(
        ctl.session().messages().last().unwrap().content,
        "Conversation length too long. Please keep it under 512 tokens."
    );

    assert!(matches!(
        ctl.append_user_turn("short").unwrap_err(),
        PuffinError::Conversation(ConversationError::Aborted)
    ));

    ctl.reset_conversation();
    assert_eq!(ctl.session().messages().len(), 1);
    ctl.append_user_turn("y = 1").unwrap();
    assert!(ctl.respond().await.unwrap().collect_text().await.is_ok());
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_guard_exact_budget_boundary() {
    let mock = Arc::new(MockEndpoint::new());
    let dispatcher = Dispatcher::new(
        mock.clone(),
        TokenGuard::new(Arc::new(FixedTokenizer(3072)), TokenBudget::new(3072).unwrap()),
        ModelParameters::default(),
        None,
    )
    .unwrap();
    let mut session = Session::default();
    session.append_user_turn("code").unwrap();
    session.append_user_turn("more code").unwrap();

    let err = dispatcher
        .dispatch(&mut session, &RefactorOptions::default(), Functionality::Refactor)
        .await
        .err()
        .unwrap();
    assert!(err.requires_reset());
    assert_eq!(mock.call_count(), 0);

    let last = session.messages().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.starts_with("Conversation length too long"));
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn test_dispatch_failure_retains_partial_output() {
    let mock = Arc::new(MockEndpoint::new());
    mock.queue_failure_after(["def f(x:", " int)"], "connection reset");
    let mut ctl = bpe_controller(mock, 3072);
    ctl.append_user_turn("def f(x): return x").unwrap();

    let mut relay = ctl.respond().await.unwrap();
    assert_eq!(relay.next().await.unwrap().unwrap(), "def f(x:");
    assert_eq!(relay.next().await.unwrap().unwrap(), " int)");
    assert!(matches!(
        relay.next().await.unwrap().unwrap_err(),
        DispatchError::Streaming { .. }
    ));
    assert!(relay.next().await.is_none());
    drop(relay);

    assert!(ctl.session().is_aborted());
    assert_eq!(ctl.session().messages().last().unwrap().content, "def f(x: int)");
}

#[tokio::test]
async fn test_failed_turn_retried_without_losing_history() {
    let mock = Arc::new(MockEndpoint::with_fragments(["def f(x: int) -> int: ..."]));
    mock.queue_failure("503 Service Unavailable");
    mock.queue_fragments(["1. Import it"]);
    let mut ctl = bpe_controller(mock.clone(), 3072);

    ctl.append_user_turn("def f(x): return x+1").unwrap();
    ctl.respond().await.unwrap().collect_text().await.unwrap();

    let err = ctl.follow_up(HOW_TO_USE).await.err().unwrap();
    assert!(matches!(err, PuffinError::Dispatch(DispatchError::ApiRequest { .. })));
    assert!(!err.requires_reset());
    assert!(ctl.session().can_retry());

    let text = ctl.respond().await.unwrap().collect_text().await.unwrap();
    assert_eq!(text, "1. Import it");
    assert_eq!(mock.call_count(), 3);
    assert_eq!(ctl.session().status(), ConversationStatus::Idle);

    let messages = ctl.session().messages();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[1].content, "def f(x): return x+1");
    assert_eq!(messages[2].content, "def f(x: int) -> int: ...");
    assert!(messages[3].content.starts_with("\n - Show me step by step"));

    let requests = mock.requests();
    assert!(!requests[2].prompt.contains("Apply the following criteria"));
}

#[tokio::test]
async fn test_controller_from_mock_config() {
    let overrides = ConfigOverrides {
        endpoint: EndpointOverrides {
            provider: Some("mock".into()),
            model: None,
        },
        ..ConfigOverrides::default()
    };
    let mut config: PuffinConfig = load_config(None, Some(&overrides)).unwrap();
    config.options.programming_language = Some("SQL".into());

    let mut ctl = ConversationController::from_config(&config, None).unwrap();
    assert_eq!(ctl.dispatcher().endpoint().name(), "mock");
    assert_eq!(ctl.options().sql_variant.as_deref(), Some("Snowflake"));
    assert!(ctl.options().sql_formatting);
    assert!(ctl.options().validate(&RefactorMenu::default()).is_ok());

    ctl.append_user_turn("select * from t").unwrap();
    let text = ctl.respond().await.unwrap().collect_text().await.unwrap();
    assert!(!text.is_empty());
}
