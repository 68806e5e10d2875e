//! Hosted chat-model clients.
//!
//! The workflow talks to the model through [`ChatModel`]: a one-shot
//! `complete` call for grading and non-streaming answers, and `stream`,
//! which yields answer fragments over an mpsc channel as the provider
//! produces them.
//!
//! Two providers are built in:
//!
//! | Provider | Wire format |
//! |----------|-------------|
//! | `gemini` | Google Generative Language API, SSE via `alt=sse` |
//! | `openai` | OpenAI-compatible `/v1/chat/completions` (OpenAI, LM Studio, vLLM) |

mod gemini;
mod openai;

pub use gemini::GeminiModel;
pub use openai::OpenAiCompatibleModel;

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Ordered answer fragments. The channel closes when generation ends; an
/// `Err` item is the last item sent.
pub type TokenStream = mpsc::Receiver<Result<String, LlmError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// Send `prompt` and wait for the full reply text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Send `prompt` and receive the reply incrementally.
    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError>;
}

/// Build the chat model selected by `config`, reading the API key from the
/// environment.
pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    let api_key = std::env::var(config.api_key_var()).ok();

    match config.provider.as_str() {
        "gemini" => {
            let key = api_key.ok_or_else(|| {
                anyhow::anyhow!("{} environment variable not set", config.api_key_var())
            })?;
            Ok(Arc::new(GeminiModel::new(config, key)?))
        }
        "openai" => Ok(Arc::new(OpenAiCompatibleModel::new(config, api_key)?)),
        other => anyhow::bail!("Unknown llm provider: '{}'", other),
    }
}

/// Drive an SSE response body on a background task, sending the text that
/// `extract` pulls out of each JSON event. Extraction errors end the stream.
pub(crate) fn spawn_sse_reader<F>(response: reqwest::Response, extract: F) -> TokenStream
where
    F: Fn(&Value) -> Result<Option<String>, LlmError> + Send + Sync + 'static,
{
    spawn_event_reader(response.bytes_stream(), extract)
}

/// Event decoding over any byte stream. Events are framed by
/// `eventsource-stream`, so UTF-8 sequences split across reads stay intact.
pub(crate) fn spawn_event_reader<S, B, E, F>(body: S, extract: F) -> TokenStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<LlmError> + std::fmt::Display + Send + 'static,
    F: Fn(&Value) -> Result<Option<String>, LlmError> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut events = std::pin::pin!(body.eventsource());

        while let Some(event) = events.next().await {
            let item = match event {
                Ok(event) => decode_event(&event.data, &extract),
                Err(EventStreamError::Transport(e)) => Some(Err(e.into())),
                Err(e) => Some(Err(LlmError::Parse(e.to_string()))),
            };
            if let Some(msg) = item {
                let failed = msg.is_err();
                if tx.send(msg).await.is_err() || failed {
                    return;
                }
            }
        }
    });

    rx
}

fn decode_event<F>(data: &str, extract: &F) -> Option<Result<String, LlmError>>
where
    F: Fn(&Value) -> Result<Option<String>, LlmError>,
{
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(LlmError::Parse(e.to_string()))),
    };
    match extract(&json) {
        Ok(Some(text)) if !text.is_empty() => Some(Ok(text)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}

/// Read a non-success response body and classify it.
pub(crate) async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    LlmError::from_status(status, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn text_field(v: &Value) -> Result<Option<String>, LlmError> {
        Ok(v["t"].as_str().map(str::to_owned))
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<Result<String, LlmError>> {
        let body = stream::iter(chunks.into_iter().map(Ok::<_, LlmError>));
        let mut rx = spawn_event_reader(body, text_field);
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    fn texts(items: Vec<Result<String, LlmError>>) -> Vec<String> {
        items.into_iter().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn events_split_across_reads() {
        let out = collect(vec![
            b"data: {\"t\":".to_vec(),
            b"\"a\"}\n\ndata: {\"t\":\"b\"}\n\n".to_vec(),
        ])
        .await;
        assert_eq!(texts(out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn multibyte_character_split_across_reads() {
        let raw = "data: {\"t\":\"café\"}\n\n".as_bytes();
        let split = raw.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let out = collect(vec![raw[..split].to_vec(), raw[split..].to_vec()]).await;
        assert_eq!(texts(out), vec!["café"]);
    }

    #[tokio::test]
    async fn comments_and_done_marker_are_skipped() {
        let out = collect(vec![
            b": keep-alive\n\nevent: message\ndata: {\"t\":\"x\"}\n\ndata: [DONE]\n\n".to_vec(),
        ])
        .await;
        assert_eq!(texts(out), vec!["x"]);
    }

    #[tokio::test]
    async fn crlf_framing_is_accepted() {
        let out = collect(vec![b"data: {\"t\":\"x\"}\r\n\r\n".to_vec()]).await;
        assert_eq!(texts(out), vec!["x"]);
    }

    #[tokio::test]
    async fn malformed_payload_ends_stream_with_error() {
        let out = collect(vec![
            b"data: not json\n\ndata: {\"t\":\"never\"}\n\n".to_vec(),
        ])
        .await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(LlmError::Parse(_))));
    }

    #[tokio::test]
    async fn transport_error_is_forwarded() {
        let body = stream::iter(vec![
            Ok(b"data: {\"t\":\"ok\"}\n\n".to_vec()),
            Err(LlmError::RateLimited("quota".into())),
        ]);
        let mut rx = spawn_event_reader(body, text_field);
        assert_eq!(rx.recv().await.unwrap().unwrap(), "ok");
        assert!(rx.recv().await.unwrap().unwrap_err().is_rate_limited());
        assert!(rx.recv().await.is_none());
    }
}
