use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::{error_from_response, spawn_sse_reader, ChatModel, TokenStream};
use crate::config::LlmConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Any server speaking the OpenAI `/v1/chat/completions` protocol.
pub struct OpenAiCompatibleModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiCompatibleModel {
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> anyhow::Result<Self> {
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

    async fn post(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "stream": stream,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let payload: Value = self.post(prompt, false).await?.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Parse("response has no message content".into()))
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream, LlmError> {
        let response = self.post(prompt, true).await?;
        Ok(spawn_sse_reader(response, delta_text))
    }
}

fn delta_text(payload: &Value) -> Result<Option<String>, LlmError> {
    if let Some(err) = payload.get("error") {
        return Err(LlmError::Other(err.to_string()));
    }
    Ok(payload["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string))
}
