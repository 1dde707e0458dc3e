//! Language-model collaborator.
//!
//! The model only ever sees form field descriptors and *placeholder* names
//! for user data, never actual values. Its output is untrusted and must pass
//! the mapper's guardrails before anything derived from it touches a request.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// A fallible completion backend. Network and quota errors are recoverable
/// at the stage boundary (the broker fails, the run continues).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a prompt, return the raw text completion.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// OpenAI chat-completions backend.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout_ms: u64,
}

impl OpenAiClient {
    /// Build from the environment.
    ///
    /// `OPENAI_API_KEY` is required; `OPTOUT_OPENAI_MODEL` overrides the
    /// default model.
    pub fn from_env(timeout_ms: u64) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY is required for the AI fallback pipeline")?;
        let model = std::env::var("OPTOUT_OPENAI_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            timeout_ms,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI returned {status}: {text}");
        }

        let parsed: serde_json::Value = resp.json().await.context("invalid OpenAI response")?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .context("OpenAI response missing message content")?;
        Ok(content.to_string())
    }
}
