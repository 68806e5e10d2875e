use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{error_from_response, spawn_sse_reader, ChatModel, TokenStream};
use crate::config::LlmConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini via the Generative Language REST API.
pub struct GeminiModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl GeminiModel {
    pub fn new(config: &LlmConfig, api_key: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    fn body(&self, prompt: &str) -> Value {
        json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": self.temperature },
        })
    }

    async fn post(&self, url: &str, prompt: &str) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.body(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self.post(&url, prompt).await?;
        let payload: Value = response.json().await?;
        let text = candidate_text(&payload)?.unwrap_or_default();
        debug!(model = %self.model, chars = text.len(), "gemini completion");
        Ok(text)
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let response = self.post(&url, prompt).await?;
        Ok(spawn_sse_reader(response, candidate_text))
    }
}

/// Concatenated text parts of the first candidate. An embedded `error`
/// object (sent mid-stream on quota exhaustion) becomes an [`LlmError`].
fn candidate_text(payload: &Value) -> Result<Option<String>, LlmError> {
    if let Some(err) = payload.get("error") {
        let code = err["code"].as_u64().unwrap_or(0) as u16;
        return Err(LlmError::from_status(code, err.to_string()));
    }

    let parts = match payload["candidates"][0]["content"]["parts"].as_array() {
        Some(parts) => parts,
        None => return Ok(None),
    };
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    Ok(Some(text))
}
