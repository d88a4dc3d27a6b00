//! Minimal blocking client for OpenAI-style chat completions.
//!
//! Single-shot requests only; streaming is out of scope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("chat completion request failed: {0}")]
    Http(#[source] Box<ureq::Error>),
    #[error("failed decoding chat completion response: {0}")]
    Decode(#[from] std::io::Error),
    #[error("chat completion response contained no choices")]
    EmptyChoices,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

pub struct ChatClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
}

impl ChatClient {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_BASE)
    }

    /// Point the client at a non-default endpoint, e.g. a local proxy.
    #[must_use]
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            agent: ureq::agent(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    /// Send one chat-completion request and return the first choice's text.
    ///
    /// # Errors
    /// Returns `ClientError::Http` for transport or non-2xx responses,
    /// `Decode` when the body is not the expected JSON shape, and
    /// `EmptyChoices` when the response carries no choices.
    pub fn complete(&self, request: &ChatRequest) -> Result<String, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(request)
            .map_err(|err| ClientError::Http(Box::new(err)))?;

        let body: ChatResponse = response.into_json()?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(ClientError::EmptyChoices)
    }
}
