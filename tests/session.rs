//! Session relay: event protocol, persistence and rate-limit handling over
//! an in-memory channel.

mod common;

use async_trait::async_trait;
use std::sync::Arc;

use common::*;
use context_relay::app::App;
use context_relay::chunk::Chunker;
use context_relay::error::PersistenceError;
use context_relay::models::{Conversation, Message, Page, Role};
use context_relay::relay::{SessionEvent, SessionRelay, RATE_LIMIT_ADVISORY};
use context_relay::store::ConversationStore;

async fn indexed_app() -> App {
    let app = test_app_without_ocr().await;
    let pages = vec![Page {
        number: 1,
        text: "Greeting etiquette: reply to hi with a friendly hello.".to_string(),
    }];
    let chunks = Chunker::default().split("doc-1", &pages).unwrap();
    app.index.upsert(&chunks).await.unwrap();
    app
}

fn relay_for(app: &App, model: Arc<FakeModel>, persist: bool) -> SessionRelay {
    let store: Option<Arc<dyn ConversationStore>> = if persist {
        Some(app.store.clone())
    } else {
        None
    };
    SessionRelay::new(app.workflow_with(model), store)
}

#[tokio::test]
async fn turn_streams_status_chunks_end_and_persists_both_messages() {
    let app = indexed_app().await;
    let store: Arc<dyn ConversationStore> = app.store.clone();
    let conv = store.create(None).await.unwrap();

    let relay = relay_for(&app, Arc::new(FakeModel::answering(&["Hel", "lo", "!"])), true);
    let mut channel = FakeChannel::with_questions(&["hi"]);
    relay.run(&mut channel, Some(&conv.id)).await;

    let events = &channel.sent;
    assert_eq!(events.first(), Some(&SessionEvent::Status("Thinking...".into())));
    assert_eq!(events.last(), Some(&SessionEvent::end()));
    assert!(events[1..events.len() - 1]
        .iter()
        .all(|e| matches!(e, SessionEvent::Chunk(_))));
    assert_eq!(chunk_text(events), "Hello!");

    let messages = store.list_messages(&conv.id).await.unwrap();
    let pairs: Vec<(Role, &str)> = messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(pairs, vec![(Role::User, "hi"), (Role::Assistant, "Hello!")]);

    let conv = store.find(&conv.id).await.unwrap().unwrap();
    assert_eq!(conv.title, "hi");
}

#[tokio::test]
async fn rate_limit_sends_advisory_and_session_survives() {
    let app = indexed_app().await;
    let store: Arc<dyn ConversationStore> = app.store.clone();
    let conv = store.create(None).await.unwrap();

    let model = Arc::new(FakeModel::answering(&[]).with_answer_failure(Failure::RateLimited));
    let relay = relay_for(&app, model.clone(), true);
    let mut channel = FakeChannel::with_questions(&["first?", "second?"]);
    relay.run(&mut channel, Some(&conv.id)).await;

    let turns = channel.turns();
    assert_eq!(turns.len(), 2, "both questions must be answered");
    for turn in &turns {
        assert_eq!(
            turn,
            &vec![
                SessionEvent::Status("Thinking...".into()),
                SessionEvent::Chunk(RATE_LIMIT_ADVISORY.into()),
                SessionEvent::end(),
            ]
        );
    }

    // Questions are saved, failed answers are not
    let messages = store.list_messages(&conv.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.role == Role::User));
}

#[tokio::test]
async fn rate_limit_mid_stream_replaces_rest_of_turn() {
    let app = indexed_app().await;
    let model = Arc::new(
        FakeModel::answering(&["par", "tial"]).with_mid_stream_failure(Failure::RateLimited),
    );
    let relay = relay_for(&app, model, false);
    let mut channel = FakeChannel::with_questions(&["hi"]);
    relay.run(&mut channel, None).await;

    let events = &channel.sent;
    assert_eq!(
        events[events.len() - 2],
        SessionEvent::Chunk(RATE_LIMIT_ADVISORY.into())
    );
    assert_eq!(events.last(), Some(&SessionEvent::end()));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::End(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn model_error_is_shown_as_answer_text() {
    let app = indexed_app().await;
    let store: Arc<dyn ConversationStore> = app.store.clone();
    let conv = store.create(None).await.unwrap();

    let model = Arc::new(FakeModel::answering(&[]).with_answer_failure(Failure::Other));
    let relay = relay_for(&app, model, true);
    let mut channel = FakeChannel::with_questions(&["hi"]);
    relay.run(&mut channel, Some(&conv.id)).await;

    let text = chunk_text(&channel.sent);
    assert!(text.starts_with("Error: "), "got {text}");
    assert_eq!(channel.sent.last(), Some(&SessionEvent::end()));

    let messages = store.list_messages(&conv.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, text);
}

#[tokio::test]
async fn unknown_conversation_still_answers_without_saving() {
    let app = indexed_app().await;
    let relay = relay_for(&app, Arc::new(FakeModel::answering(&["ok"])), true);
    let mut channel = FakeChannel::with_questions(&["hi"]);
    relay.run(&mut channel, Some("does-not-exist")).await;

    assert_eq!(chunk_text(&channel.sent), "ok");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn legacy_session_streams_without_persistence() {
    let app = indexed_app().await;
    let relay = relay_for(&app, Arc::new(FakeModel::answering(&["a", "b"])), false);
    let mut channel = FakeChannel::with_questions(&["one", "two"]);
    relay.run(&mut channel, None).await;

    let turns = channel.turns();
    assert_eq!(turns.len(), 2);
    for turn in &turns {
        assert_eq!(chunk_text(turn), "ab");
    }
}

/// Store whose every operation fails.
struct BrokenStore;

fn broken() -> PersistenceError {
    PersistenceError(sqlx::Error::PoolClosed)
}

#[async_trait]
impl ConversationStore for BrokenStore {
    async fn create(&self, _title: Option<&str>) -> Result<Conversation, PersistenceError> {
        Err(broken())
    }
    async fn find(&self, id: &str) -> Result<Option<Conversation>, PersistenceError> {
        Ok(Some(Conversation {
            id: id.to_string(),
            title: "t".into(),
            created_at: String::new(),
            updated_at: String::new(),
            message_count: 0,
        }))
    }
    async fn list(&self) -> Result<Vec<Conversation>, PersistenceError> {
        Err(broken())
    }
    async fn rename(&self, _id: &str, _title: &str) -> Result<bool, PersistenceError> {
        Err(broken())
    }
    async fn delete(&self, _id: &str) -> Result<bool, PersistenceError> {
        Err(broken())
    }
    async fn append_message(
        &self,
        _conversation_id: &str,
        _role: Role,
        _content: &str,
    ) -> Result<Message, PersistenceError> {
        Err(broken())
    }
    async fn list_messages(&self, _conversation_id: &str) -> Result<Vec<Message>, PersistenceError> {
        Err(broken())
    }
}

#[tokio::test]
async fn persistence_failures_do_not_end_the_session() {
    let app = indexed_app().await;
    let relay = SessionRelay::new(
        app.workflow_with(Arc::new(FakeModel::answering(&["fine"]))),
        Some(Arc::new(BrokenStore)),
    );
    let mut channel = FakeChannel::with_questions(&["one", "two"]);
    relay.run(&mut channel, Some("conv")).await;

    let turns = channel.turns();
    assert_eq!(turns.len(), 2);
    for turn in &turns {
        assert_eq!(chunk_text(turn), "fine");
        assert_eq!(turn.last(), Some(&SessionEvent::end()));
    }
}
