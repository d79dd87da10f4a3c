//! End-to-end tests for the conversation engine
//!
//! These drive sessions only through the public API: handles and clients,
//! the clipboard, the chain runner and the file store together.

use async_trait::async_trait;
use colloquy_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Answers after a short delay with fixed usage
struct SlowClient {
    delay: Duration,
}

#[async_trait]
impl ChatClient for SlowClient {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity::new("test", "slow")
    }

    async fn send(
        &self,
        context: &[ChatMessage],
        _system_prompt: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        tokio::time::sleep(self.delay).await;
        let last = context.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(CompletionResult::text(format!("re: {}", last), TokenUsage::new(10, 5)).with_price(0.5))
    }
}

/// Never answers on its own
struct HangingClient;

#[async_trait]
impl ChatClient for HangingClient {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity::new("test", "hanging")
    }

    async fn send(
        &self,
        _context: &[ChatMessage],
        _system_prompt: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        std::future::pending().await
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("colloquy_core=debug")
        .with_test_writer()
        .try_init();
}

fn slow() -> Arc<dyn ChatClient> {
    Arc::new(SlowClient {
        delay: Duration::from_millis(20),
    })
}

fn handle_with(session: Session, client: &Arc<dyn ChatClient>) -> SessionHandle {
    SessionHandle::new(session, ClientRegistry::new().with_client(client.clone()))
}

#[tokio::test]
async fn test_concurrent_candidates_sum_totals() {
    init_tracing();
    let client = slow();
    let mut session = Session::new("concurrent");
    let (_, first) = session.submit_turn("first");
    let (_, second) = session.submit_turn("second");
    let handle = handle_with(session, &client);

    let (a, b) = futures::join!(
        handle.new_candidate(first, client.clone(), CancellationToken::new()),
        handle.new_candidate(second, client.clone(), CancellationToken::new()),
    );
    a.unwrap();
    b.unwrap();

    let session = handle.lock().await;
    assert_eq!(session.tokens_consumed(), 30);
    assert!((session.total_price() - 1.0).abs() < f64::EPSILON);
    assert_eq!(handle.responding_count(), 0);
    for group in [first, second] {
        let (_, group) = session.timeline().group(group).unwrap();
        assert_eq!(group.len(), 1);
        assert!(group.is_consistent());
    }
}

#[tokio::test]
async fn test_regenerate_and_switch_changes_replay() {
    let client = slow();
    let handle = handle_with(Session::new("branches"), &client);

    let (group, first) = handle
        .submit("tell me a joke", client.clone(), CancellationToken::new())
        .await
        .unwrap();
    let second = handle
        .new_candidate(group, Arc::new(EchoClient::default()), CancellationToken::new())
        .await
        .unwrap();

    let mut session = handle.lock().await;
    let (_, response) = session.timeline().group(group).unwrap();
    assert_eq!(response.len(), 2);
    assert_eq!(response.accepted().map(|c| c.id), Some(second));

    session.switch_accepted(group, first).unwrap();
    session.append(RequestTurn::new("another one").into());
    let messages = to_messages(&session.resolve_context(None).unwrap());
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content, "re: tell me a joke");
}

#[tokio::test]
async fn test_cancelled_call_is_kept_but_not_replayed() {
    init_tracing();
    let client: Arc<dyn ChatClient> = Arc::new(HangingClient);
    let mut session = Session::new("cancel");
    let (_, group) = session.submit_turn("slow question");
    let handle = handle_with(session, &client);

    let cancel = CancellationToken::new();
    let task = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        let client = client.clone();
        tokio::spawn(async move { handle.new_candidate(group, client, cancel).await })
    };

    while handle.responding_count() == 0 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();
    let candidate = task.await.unwrap().unwrap();
    assert_eq!(handle.responding_count(), 0);

    let mut session = handle.lock().await;
    {
        let (_, response) = session.timeline().group(group).unwrap();
        let accepted = response.accepted().unwrap();
        assert_eq!(accepted.finish_state, FinishState::Interrupted);
        assert!(response.available_accepted().is_none());
    }
    session.append(RequestTurn::new("follow up").into());
    assert_eq!(session.resolve_context(None).unwrap().len(), 1);

    session.set_manually_valid(group, candidate, true).unwrap();
    assert_eq!(session.resolve_context(None).unwrap().len(), 3);
}

#[tokio::test]
async fn test_events_follow_mutations() {
    let mut session = Session::new("events");
    let mut events = session.subscribe();

    let (_, group) = session.submit_turn("hello");
    session.insert_erase_marker(None);

    let mut versions = Vec::new();
    let mut kinds = Vec::new();
    while let Ok(notification) = events.try_recv() {
        versions.push(notification.version);
        if let TimelineEvent::ItemInserted { kind, .. } = notification.event {
            kinds.push(kind);
        }
    }
    assert_eq!(
        kinds,
        vec![ItemKind::Request, ItemKind::ResponseGroup, ItemKind::EraseMarker]
    );
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
    assert!(session.timeline().group(group).is_some());
}

#[tokio::test]
async fn test_fork_then_continue_independently() {
    let client = slow();
    let handle = handle_with(Session::new("origin"), &client);
    handle
        .submit("one", client.clone(), CancellationToken::new())
        .await
        .unwrap();
    handle
        .submit("two", client.clone(), CancellationToken::new())
        .await
        .unwrap();

    let fork = handle.lock().await.fork(1);
    assert_eq!(fork.topic(), "origin (fork)");
    assert_eq!(fork.len(), 2);

    let fork_handle = handle_with(fork, &client);
    fork_handle
        .submit("branch", client.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fork_handle.lock().await.len(), 4);
    assert_eq!(handle.lock().await.len(), 4);
    let fork = fork_handle.lock().await;
    let replay = to_messages(&fork.resolve_context(Some(2)).unwrap());
    let texts: Vec<_> = replay.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["one", "re: one", "branch"]);
}

#[tokio::test]
async fn test_paste_across_stored_sessions() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(dir.path()).await.unwrap();
    let client = slow();

    let source = handle_with(Session::new("source"), &client);
    let (group, _) = source
        .submit("shared question", client.clone(), CancellationToken::new())
        .await
        .unwrap();
    let text = export_interaction(&*source.lock().await, group)
        .unwrap()
        .to_text()
        .unwrap();

    let target = Session::new("target");
    let target_id = target.id().to_string();
    store.save(&target.snapshot()).await.unwrap();

    let mut target = store.open(&target_id).await.unwrap().unwrap();
    let payload = InteractionPayload::from_text(&text).unwrap();
    assert!(matches!(
        import_interaction(&mut target, &payload, None).unwrap(),
        ImportOutcome::Inserted { index: 0, .. }
    ));
    store.save(&target.snapshot()).await.unwrap();

    let mut reloaded = store.open(&target_id).await.unwrap().unwrap();
    assert_eq!(reloaded.items(), source.lock().await.items());
    assert_eq!(
        import_interaction(&mut reloaded, &payload, None).unwrap(),
        ImportOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_chain_against_new_model() {
    init_tracing();
    let original = slow();
    let handle = handle_with(Session::new("chain"), &original);
    for text in ["a", "b", "c"] {
        handle
            .submit(text, original.clone(), CancellationToken::new())
            .await
            .unwrap();
    }

    let echo: Arc<dyn ChatClient> = Arc::new(EchoClient::new("replay"));
    let runner = ChainRunner::new(handle.clone(), echo.clone())
        .with_config(ChainConfig::default().with_max_attempts(2));
    let mut state = runner.subscribe();

    let report = runner.run(0..6, CancellationToken::new()).await.unwrap();
    assert_eq!(report.steps_completed, 3);
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), ChainState::Completed { total_steps: 3 });

    let session = handle.lock().await;
    assert_eq!(session.len(), 12);
    let replayed: Vec<_> = session.items()[6..]
        .iter()
        .filter_map(|item| item.as_response())
        .map(|group| group.accepted().unwrap().source.clone())
        .collect();
    assert!(replayed.iter().all(|source| *source == echo.identity()));
}
