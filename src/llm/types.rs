//! Core types for providers, messages, and completions.

use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// LLM provider backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "togetherai")]
    TogetherAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "vllm")]
    Vllm,
}

impl Provider {
    /// All recognized providers.
    pub const ALL: [Provider; 5] = [
        Provider::Google,
        Provider::OpenAI,
        Provider::TogetherAI,
        Provider::Anthropic,
        Provider::Vllm,
    ];

    /// Environment variable holding this provider's API key.
    ///
    /// The locally hosted vLLM endpoint does not enforce authentication,
    /// so it has no credential variable.
    pub fn env_key(&self) -> Option<&'static str> {
        match self {
            Self::Google => Some("GOOGLE_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::TogetherAI => Some("TOGETHER_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Vllm => None,
        }
    }

    /// Canonical tag name for system instructions in the generic chat form.
    pub fn system_tag(&self) -> &'static str {
        "system"
    }

    /// Canonical tag name for user content in the generic chat form.
    pub fn user_tag(&self) -> &'static str {
        "human"
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::OpenAI => write!(f, "openai"),
            Self::TogetherAI => write!(f, "togetherai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Vllm => write!(f, "vllm"),
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "google" => Ok(Self::Google),
            "openai" => Ok(Self::OpenAI),
            "togetherai" => Ok(Self::TogetherAI),
            "anthropic" => Ok(Self::Anthropic),
            "vllm" => Ok(Self::Vllm),
            other => Err(Error::InvalidProvider(other.to_string())),
        }
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters passed opaquely to the provider client.
///
/// No validation happens here beyond what the provider itself performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature
    pub temperature: f64,
    /// Maximum tokens to generate (provider default when unset)
    pub max_tokens: Option<u32>,
    /// Per-request HTTP timeout in seconds (no timeout when unset)
    pub timeout_secs: Option<u64>,
    /// Max retries on transient failures inside the provider client
    pub max_retries: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: None,
            max_retries: 2,
        }
    }
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Completion request in the generic chat form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to query
    pub model: Option<String>,
    /// System prompt lifted out of the message sequence (provider-dependent)
    pub system: Option<String>,
    /// Ordered conversation messages
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Completion response as a plain mapping of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response ID
    pub id: String,
    /// Model that produced the response
    pub model: String,
    /// Generated content
    pub content: String,
    /// Stop reason
    pub stop_reason: Option<StopReason>,
    /// Token usage
    pub usage: TokenUsage,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

/// Read an image file and base64-encode it as a `data:` URI suitable for
/// embedding in message content.
pub fn image_data_uri(path: impl AsRef<Path>) -> Result<String> {
    Ok(format!("data:image/jpeg;base64,{}", image_base64(path)?))
}

/// Read an image file and base64-encode it without the data-URI prefix.
pub fn image_base64(path: impl AsRef<Path>) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(BASE64.encode(bytes))
}
