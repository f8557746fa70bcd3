//! Provider client trait and implementations.
//!
//! Each client speaks its provider's native wire format over raw HTTP.
//! OpenAI, TogetherAI, and vLLM share one chat-completions format and
//! differ only in endpoint and authentication.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, Provider, StopReason, TokenUsage,
};

/// Base URL of a locally hosted inference server.
pub const LOCAL_INFERENCE_URL: &str = "http://localhost:8000/v1";

/// Credential used for the local inference server, which does not enforce
/// authentication.
pub const PLACEHOLDER_API_KEY: &str = "EMPTY";

/// Provider client trait for chat completions.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Dispatch a completion request.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for provider clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds (no timeout when unset)
    pub timeout_secs: Option<u64>,
    /// Max retries on transient failures
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: None,
            max_retries: 2,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
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

    fn resolve_model(&self, request_model: Option<String>, provider: Provider) -> Result<String> {
        request_model
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::provider_call(provider, "no model specified"))
    }
}

fn build_http_client(timeout_secs: Option<u64>) -> Client {
    let mut builder = Client::builder();
    if let Some(secs) = timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder.build().unwrap_or_default()
}

/// Send a request, retrying 429/5xx responses and transport-level failures
/// up to `max_retries` times with linear backoff. Returns the final status
/// and body; non-success statuses are the caller's to interpret.
async fn send_with_retries<F>(
    mut build: F,
    max_retries: u32,
    provider: Provider,
) -> Result<(StatusCode, String)>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                if retryable && attempt < max_retries {
                    attempt += 1;
                    tracing::debug!(%provider, %status, attempt, "retrying provider request");
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    continue;
                }
                let body = response.text().await.map_err(|e| {
                    Error::provider_call(provider, format!("failed to read response: {e}"))
                })?;
                return Ok((status, body));
            }
            Err(e) if (e.is_connect() || e.is_timeout()) && attempt < max_retries => {
                attempt += 1;
                tracing::debug!(%provider, error = %e, attempt, "retrying provider request");
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            Err(e) => {
                return Err(Error::provider_call(
                    provider,
                    format!("HTTP request failed: {e}"),
                ))
            }
        }
    }
}

/// Anthropic Claude client (native Messages API).
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MAX_TOKENS: u32 = 4096;

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn to_api_request(&self, request: CompletionRequest) -> Result<AnthropicRequest> {
        let model = self
            .config
            .resolve_model(request.model, Provider::Anthropic)?;

        // The Messages API takes system instructions as a top-level field,
        // not as a message role.
        let mut system_parts: Vec<String> = request.system.into_iter().collect();
        let mut messages = Vec::new();
        for m in request.messages {
            match m.role {
                ChatRole::System => system_parts.push(m.content),
                ChatRole::User => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: m.content,
                }),
                ChatRole::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: m.content,
                }),
            }
        }

        Ok(AnthropicRequest {
            model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            temperature: request.temperature,
        })
    }
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_request = self.to_api_request(request)?;
        let url = format!("{}/v1/messages", self.base_url());

        let (status, body) = send_with_retries(
            || {
                self.http
                    .post(&url)
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", Self::API_VERSION)
                    .header("content-type", "application/json")
                    .json(&api_request)
            },
            self.config.max_retries,
            Provider::Anthropic,
        )
        .await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::provider_call(
                    Provider::Anthropic,
                    format!("{}: {}", error.error.error_type, error.error.message),
                ));
            }
            return Err(Error::provider_call(
                Provider::Anthropic,
                format!("{status}: {body}"),
            ));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider_call(Provider::Anthropic, format!("failed to parse response: {e}")))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// Google Gemini client.
pub struct GoogleClient {
    config: ClientConfig,
    http: Client,
}

impl GoogleClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn to_api_request(&self, request: CompletionRequest) -> Result<(String, GeminiRequest)> {
        let model = self.config.resolve_model(request.model, Provider::Google)?;

        let mut system_parts: Vec<String> = request.system.into_iter().collect();
        let mut contents = Vec::new();
        for m in request.messages {
            match m.role {
                ChatRole::System => system_parts.push(m.content),
                ChatRole::User => contents.push(GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart { text: m.content }],
                }),
                ChatRole::Assistant => contents.push(GeminiContent {
                    role: "model".to_string(),
                    parts: vec![GeminiPart { text: m.content }],
                }),
            }
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: system_parts.join("\n\n"),
                }],
            })
        };

        let api_request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            }),
        };

        Ok((model, api_request))
    }
}

// Google Gemini API types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for GoogleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let (model, api_request) = self.to_api_request(request)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            model,
            self.config.api_key
        );

        let (status, body) = send_with_retries(
            || {
                self.http
                    .post(&url)
                    .header("content-type", "application/json")
                    .json(&api_request)
            },
            self.config.max_retries,
            Provider::Google,
        )
        .await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                return Err(Error::provider_call(Provider::Google, error.error.message));
            }
            return Err(Error::provider_call(
                Provider::Google,
                format!("{status}: {body}"),
            ));
        }

        let api_response: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider_call(Provider::Google, format!("failed to parse response: {e}")))?;

        let candidate = api_response
            .candidates
            .first()
            .ok_or_else(|| Error::provider_call(Provider::Google, "no candidates in response"))?;

        let content = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = candidate.finish_reason.as_deref().map(|r| match r {
            "STOP" => StopReason::EndTurn,
            "MAX_TOKENS" => StopReason::MaxTokens,
            "STOP_SEQUENCE" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        let usage = api_response
            .usage_metadata
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count.unwrap_or(0),
                output_tokens: u.candidates_token_count.unwrap_or(0),
            })
            .unwrap_or_default();

        // Gemini does not return a response ID
        let id = format!("gemini-{}", Utc::now().timestamp_millis());

        Ok(CompletionResponse {
            id,
            model,
            content,
            stop_reason,
            usage,
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }
}

/// Client for OpenAI-compatible chat-completions endpoints.
///
/// OpenAI, TogetherAI, and a locally hosted vLLM server all accept the same
/// request shape; they differ only in base URL and credential handling.
pub struct OpenAiCompatClient {
    provider: Provider,
    config: ClientConfig,
    http: Client,
}

impl OpenAiCompatClient {
    const OPENAI_BASE_URL: &'static str = "https://api.openai.com";
    const TOGETHER_BASE_URL: &'static str = "https://api.together.xyz";

    fn new(provider: Provider, default_base_url: &str, mut config: ClientConfig) -> Self {
        if config.base_url.is_none() {
            config.base_url = Some(default_base_url.to_string());
        }
        let http = build_http_client(config.timeout_secs);
        Self {
            provider,
            config,
            http,
        }
    }

    /// Client for the OpenAI API.
    pub fn openai(config: ClientConfig) -> Self {
        Self::new(Provider::OpenAI, Self::OPENAI_BASE_URL, config)
    }

    /// Client for the TogetherAI API.
    pub fn together(config: ClientConfig) -> Self {
        Self::new(Provider::TogetherAI, Self::TOGETHER_BASE_URL, config)
    }

    /// Client for a locally hosted vLLM server. The endpoint is generic, so
    /// the served model must be named explicitly on every request.
    pub fn vllm(config: ClientConfig) -> Self {
        Self::new(Provider::Vllm, LOCAL_INFERENCE_URL, config)
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::OPENAI_BASE_URL)
    }

    fn completions_url(&self) -> String {
        let base = self.base_url().trim_end_matches('/');
        // The local server already mounts under /v1
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn to_api_request(&self, request: CompletionRequest) -> Result<OpenAiRequest> {
        let model = self.config.resolve_model(request.model, self.provider)?;

        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        for m in request.messages {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(OpenAiMessage {
                role: role.to_string(),
                content: m.content,
            });
        }

        Ok(OpenAiRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        })
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let api_request = self.to_api_request(request)?;
        let url = self.completions_url();

        let (status, body) = send_with_retries(
            || {
                self.http
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.config.api_key))
                    .header("content-type", "application/json")
                    .json(&api_request)
            },
            self.config.max_retries,
            self.provider,
        )
        .await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OpenAiError>(&body) {
                return Err(Error::provider_call(self.provider, error.error.message));
            }
            return Err(Error::provider_call(
                self.provider,
                format!("{status}: {body}"),
            ));
        }

        let api_response: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider_call(self.provider, format!("failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider_call(self.provider, "no choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content,
            stop_reason,
            usage,
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}
