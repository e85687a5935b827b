//! Optional chatbot relay to a local Ollama server.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DISABLED_MESSAGE: &str =
    "The chatbot is not enabled. Please set OLLAMA_ENABLED=true in your environment.";

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantConfig {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Error)]
pub enum AssistantError {
    /// The model server could not be reached or answered with an error status.
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Assistant: Send + Sync {
    /// Ask a question about the given code.
    async fn ask(&self, query: &str, code: &str) -> Result<String, AssistantError>;

    fn model(&self) -> &str;
}

/// Text shown to the room when `ask` fails.
pub fn failure_message(error: &AssistantError, model: &str) -> String {
    match error {
        AssistantError::Transport(details) => format!(
            "Error: Could not connect to the Ollama server. Please ensure Ollama is running and the '{}' model is pulled. Details: {}",
            model, details
        ),
        AssistantError::Other(details) => format!(
            "Error: An error occurred while processing your request: {}",
            details
        ),
    }
}

pub fn build_prompt(query: &str, code: &str) -> String {
    format!(
        "You are a helpful AI assistant for a collaborative code editor.\n\
         Your task is to analyze the provided Python code and answer a user's question about it.\n\
         Be concise and helpful. Respond with code examples when appropriate.\n\
         Current Python Code:\n\
         ```python\n{}\n```\n\n\
         User's question: {}\n",
        code, query
    )
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

pub struct OllamaAssistant {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaAssistant {
    pub fn new(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AssistantError::Other(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Assistant for OllamaAssistant {
    async fn ask(&self, query: &str, code: &str) -> Result<String, AssistantError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(query, code),
            stream: false,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| AssistantError::Transport(e.to_string()))?;

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| AssistantError::Other(e.to_string()))?;
        parsed
            .response
            .ok_or_else(|| AssistantError::Other("missing 'response' field".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
