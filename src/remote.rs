//! OpenAI-compatible completions client
//!
//! For models served elsewhere (e.g. vLLM hosting gpt-oss). The prompt is
//! rendered in the harmony chat format and sent to `/completions` with
//! special tokens kept in the returned text.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ModelClient;
use crate::prompt::SYSTEM_INSTRUCTION;

/// Render a system instruction and user prompt in harmony format, leaving
/// the assistant turn open
pub fn harmony_prompt(system_prompt: &str, prompt: &str) -> String {
    format!(
        "<|start|>system<|message|>{system_prompt}<|end|><|start|>user<|message|>{prompt}<|end|><|start|>assistant"
    )
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    max_tokens: usize,
    temperature: f64,
    skip_special_tokens: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

/// Blocking client for a `/v1/completions` endpoint
pub struct CompletionsClient {
    http: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
}

impl CompletionsClient {
    /// Create a client for `base_url` (e.g. `http://localhost:8000/v1`)
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            url: format!("{}/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            system_prompt: SYSTEM_INSTRUCTION.to_string(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }

    /// Full endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ModelClient for CompletionsClient {
    fn generate(&mut self, prompt: &str, max_new_tokens: usize, temperature: f64) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            prompt: harmony_prompt(&self.system_prompt, prompt),
            max_tokens: max_new_tokens,
            temperature,
            skip_special_tokens: false,
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: CompletionResponse = request
            .send()
            .with_context(|| format!("Request to {} failed", self.url))?
            .error_for_status()?
            .json()
            .context("Invalid completion response")?;

        let text = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| anyhow!("Completion response has no choices"))?;
        debug!("Received {} bytes from {}", text.len(), self.url);
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
