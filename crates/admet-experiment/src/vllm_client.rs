//! vLLM client for the OpenAI-compatible chat completions API.
//!
//! Implements the [`Completion`] capability over HTTP. Request timeouts are
//! enforced by reqwest and reported as [`CompletionError::Timeout`]; every
//! other failure (connect, status, decode) is a transport error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use experience_kernel::{Completion, CompletionError, CompletionRequest};

/// Default system prompt for ADMET prediction.
pub const ADMET_SYSTEM_PROMPT: &str = "You are an expert medicinal chemist predicting ADMET \
    properties of small molecules. Reason about molecular features, then finish with a single \
    numeric prediction.";

/// vLLM client for chat completions.
#[derive(Clone)]
pub struct VllmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    system_prompt: String,
    top_p: f32,
}

/// A chat message with role and content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request body for /v1/chat/completions.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

/// Response from /v1/chat/completions.
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// A single choice in the response.
#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl VllmClient {
    /// Create a new vLLM client.
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the vLLM server (e.g., "http://localhost:8000")
    /// * `model` - Model name served by that instance (e.g., "Qwen/Qwen2.5-7B-Instruct")
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            system_prompt: ADMET_SYSTEM_PROMPT.to_string(),
            top_p: 0.95,
        }
    }

    /// Replace the system prompt sent with every request.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one chat completion and return the first choice's content.
    async fn chat(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: self.top_p,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                CompletionError::Timeout(request.timeout)
            } else {
                CompletionError::Transport(e.to_string())
            }
        };

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Transport(format!(
                "vLLM request failed with status {status}: {body}"
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(classify)?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CompletionError::Transport("No choices in vLLM response".to_string()))?;

        debug!(chars = content.len(), "vLLM completion received");
        Ok(content)
    }

    /// Check if the vLLM server is healthy.
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Fail with context if the server does not answer its health endpoint.
    pub async fn ensure_healthy(&self) -> Result<()> {
        let healthy = self
            .health_check()
            .await
            .context("Failed to query vLLM health endpoint")?;
        anyhow::ensure!(healthy, "vLLM server at {} is not healthy", self.base_url);
        Ok(())
    }
}

impl Completion for VllmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        self.chat(&request).await
    }
}
