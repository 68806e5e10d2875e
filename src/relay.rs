//! Per-connection question/answer loop.
//!
//! A [`SessionRelay`] owns nothing per session; [`SessionRelay::run`] is
//! called once per connected client with that client's [`SessionChannel`]
//! and serves questions until the channel closes. Each turn:
//!
//! 1. the question is stored as a `user` message,
//! 2. a `status` event is sent and the workflow runs,
//! 3. every answer fragment is forwarded as a `chunk` event,
//! 4. an `end` event closes the turn and the full answer is stored as an
//!    `assistant` message.
//!
//! Storage failures are logged and never end the session. A rate-limited
//! model produces a fixed advisory instead of an answer.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::WorkflowError;
use crate::models::Role;
use crate::store::ConversationStore;
use crate::workflow::Workflow;

pub const STATUS_THINKING: &str = "Thinking...";
pub const RATE_LIMIT_ADVISORY: &str =
    "⚠️ Rate limit reached. Please wait about 60 seconds before asking another question.";

/// Server-to-client event, serialised as `{"type": ..., "content": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum SessionEvent {
    Status(String),
    Chunk(String),
    End(String),
}

impl SessionEvent {
    pub fn end() -> Self {
        SessionEvent::End(String::new())
    }
}

/// Bidirectional client connection.
#[async_trait]
pub trait SessionChannel: Send {
    /// Wait for the next question. `None` once the client has gone.
    async fn recv(&mut self) -> Option<String>;

    async fn send(&mut self, event: SessionEvent) -> anyhow::Result<()>;
}

pub struct SessionRelay {
    workflow: Arc<Workflow>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl SessionRelay {
    pub fn new(workflow: Arc<Workflow>, store: Option<Arc<dyn ConversationStore>>) -> Self {
        Self { workflow, store }
    }

    /// Serve `channel` until it closes. With a `conversation_id`, turns are
    /// persisted to that conversation.
    pub async fn run<C: SessionChannel>(&self, channel: &mut C, conversation_id: Option<&str>) {
        info!(conversation = conversation_id.unwrap_or("-"), "session opened");

        while let Some(question) = channel.recv().await {
            if let Err(e) = self.turn(channel, conversation_id, &question).await {
                warn!(error = %e, "session channel failed");
                break;
            }
        }

        info!(conversation = conversation_id.unwrap_or("-"), "session closed");
    }

    /// One question/answer exchange. Errors are channel errors only.
    async fn turn<C: SessionChannel>(
        &self,
        channel: &mut C,
        conversation_id: Option<&str>,
        question: &str,
    ) -> anyhow::Result<()> {
        let bound = match conversation_id {
            Some(id) => self.persist_user(id, question).await,
            None => false,
        };

        channel
            .send(SessionEvent::Status(STATUS_THINKING.to_string()))
            .await?;

        let mut tokens = match self.workflow.run_streaming(question).await {
            Ok(tokens) => tokens,
            Err(e) => return send_failure(channel, &e).await,
        };

        let mut answer = String::new();
        while let Some(item) = tokens.recv().await {
            match item {
                Ok(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    answer.push_str(&fragment);
                    channel.send(SessionEvent::Chunk(fragment)).await?;
                }
                Err(e) => return send_failure(channel, &WorkflowError::from(e)).await,
            }
        }

        channel.send(SessionEvent::end()).await?;
        debug!(chars = answer.len(), "answer streamed");

        if let (true, Some(id)) = (bound, conversation_id) {
            if !answer.is_empty() {
                self.persist(id, Role::Assistant, &answer).await;
            }
        }
        Ok(())
    }

    /// Store the question. Returns whether the conversation exists.
    async fn persist_user(&self, conversation_id: &str, question: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.find(conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(conversation = conversation_id, "conversation not found, not saving");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Error looking up conversation");
                return false;
            }
        }
        self.persist(conversation_id, Role::User, question).await;
        true
    }

    async fn persist(&self, conversation_id: &str, role: Role, content: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.append_message(conversation_id, role, content).await {
            error!(error = %e, role = role.as_str(), "Error saving message");
        }
    }
}

/// Report a failed turn to the client and close it.
async fn send_failure<C: SessionChannel>(channel: &mut C, err: &WorkflowError) -> anyhow::Result<()> {
    let content = if err.is_rate_limited() {
        warn!("model rate limit reached");
        RATE_LIMIT_ADVISORY.to_string()
    } else {
        error!(error = %err, "turn failed");
        format!("Error processing request: {}", err)
    };
    channel.send(SessionEvent::Chunk(content)).await?;
    channel.send(SessionEvent::end()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_as_type_and_content() {
        let json = serde_json::to_value(SessionEvent::Chunk("hel".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "chunk", "content": "hel" }));

        let json = serde_json::to_value(SessionEvent::end()).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "end", "content": "" }));

        let json = serde_json::to_value(SessionEvent::Status(STATUS_THINKING.into())).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["content"], "Thinking...");
    }
}
