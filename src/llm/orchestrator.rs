//! Query orchestration across provider backends.
//!
//! [`QueryOrchestrator`] selects a provider client, resolves credentials,
//! optionally manages a local inference server, wraps role-tagged messages,
//! and dispatches queries with an optional pre-call delay and an optional
//! on-disk response cache.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};

use super::cache::{request_fingerprint, ResponseCache};
use super::client::{
    AnthropicClient, ClientConfig, GoogleClient, LlmClient, OpenAiCompatClient,
    PLACEHOLDER_API_KEY,
};
use super::server::{InferenceServer, ServerConfig};
use super::types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, GenerationParams, Provider,
};

/// Configuration for a [`QueryOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Provider backend
    pub provider: Provider,
    /// Model to query
    pub model: String,
    /// Explicit API key; when unset the provider's environment variable is read
    pub api_key: Option<String>,
    /// Generation parameters passed through to the provider client
    pub params: GenerationParams,
    /// Pre-call delay in seconds
    pub delay_secs: Option<u64>,
    /// Response cache name (normalized to a `.db` file)
    pub cache: Option<String>,
    /// The vLLM server is hosted externally; do not spawn one
    pub host_server_externally: bool,
    /// Inference-server overrides (vLLM only)
    pub server: Option<ServerConfig>,
}

impl OrchestratorConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: None,
            params: GenerationParams::default(),
            delay_secs: None,
            cache: None,
            host_server_externally: false,
            server: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_delay(mut self, secs: u64) -> Self {
        self.delay_secs = Some(secs);
        self
    }

    pub fn with_cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    pub fn with_external_server(mut self) -> Self {
        self.host_server_externally = true;
        self
    }

    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }
}

/// Orchestrates queries against one provider/model pair.
///
/// Credentials are resolved into the orchestrator's own configuration and
/// handed to the client constructor; the process environment is read but
/// never written. The response cache and any spawned inference server are
/// owned by this instance.
pub struct QueryOrchestrator {
    provider: Provider,
    model: String,
    api_key: String,
    params: GenerationParams,
    delay: Option<Duration>,
    cache: Option<ResponseCache>,
    client: Box<dyn LlmClient>,
    server: Option<InferenceServer>,
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("params", &self.params)
            .field("delay", &self.delay)
            .field("cache", &self.cache.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl QueryOrchestrator {
    /// Construct the orchestrator: resolve the credential, spawn the
    /// inference server when required, initialize the provider client, and
    /// open the response cache. Any failure aborts construction.
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        let api_key = resolve_api_key(config.provider, config.api_key.as_deref())?;

        tracing::info!(
            provider = %config.provider,
            model = %config.model,
            "initializing query orchestrator"
        );

        let server = if config.provider == Provider::Vllm && !config.host_server_externally {
            let server_config = config
                .server
                .clone()
                .unwrap_or_else(|| ServerConfig::new(&config.model));
            Some(InferenceServer::start(&server_config).await?)
        } else {
            None
        };

        let base_url_override = server.as_ref().map(|s| s.base_url().to_string());
        let client = build_client(
            config.provider,
            &config.model,
            &api_key,
            &config.params,
            base_url_override,
        );

        let cache = match &config.cache {
            Some(name) => {
                let cache = ResponseCache::open(name)?;
                tracing::info!(path = %cache.path().display(), "response cache attached");
                Some(cache)
            }
            None => None,
        };

        Ok(Self {
            provider: config.provider,
            model: config.model,
            api_key,
            params: config.params,
            delay: config.delay_secs.map(Duration::from_secs),
            cache,
            client,
            server,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The resolved API key this instance dispatches with.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Canonical tag name for system instructions.
    pub fn system_tag(&self) -> &'static str {
        self.provider.system_tag()
    }

    /// Canonical tag name for user content.
    pub fn user_tag(&self) -> &'static str {
        self.provider.user_tag()
    }

    /// Path of the attached response cache, when one is configured.
    pub fn cache_path(&self) -> Option<&std::path::Path> {
        self.cache.as_ref().map(|c| c.path())
    }

    /// Process id of an owned inference server, when one was spawned.
    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().map(|s| s.pid())
    }

    /// Wrap role-tagged messages into the ordered generic chat sequence.
    ///
    /// Only `System` and `User` roles participate in a query. Any other
    /// role is omitted from the wrapped sequence; the drop is deliberate
    /// and logged at warn level.
    pub fn wrap_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut wrapped = Vec::with_capacity(messages.len());
        for message in messages {
            match message.role {
                ChatRole::System | ChatRole::User => wrapped.push(message.clone()),
                other => {
                    tracing::warn!(role = ?other, "dropping message with unsupported role");
                }
            }
        }
        wrapped
    }

    /// Dispatch a query. Applies wrapping, the configured pre-call delay,
    /// and the response cache; a cache hit returns the stored response
    /// without dispatching. Client errors propagate verbatim.
    pub async fn query(&self, messages: &[ChatMessage]) -> Result<CompletionResponse> {
        let wrapped = self.wrap_messages(messages);

        if let Some(delay) = self.delay {
            tracing::info!(seconds = delay.as_secs(), "delaying before dispatch");
            tokio::time::sleep(delay).await;
        }

        let fingerprint = request_fingerprint(self.provider, &self.model, &wrapped);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&fingerprint)? {
                tracing::debug!(fingerprint = %&fingerprint[..16], "response cache hit");
                return Ok(hit);
            }
        }

        // The model is always named explicitly: the local inference endpoint
        // is generic and does not otherwise know which served model to target.
        let mut request = CompletionRequest::new()
            .with_model(self.model.clone())
            .with_messages(wrapped)
            .with_temperature(self.params.temperature);
        if let Some(max_tokens) = self.params.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.client.complete(request).await?;

        if let Some(cache) = &self.cache {
            cache.put(&fingerprint, self.provider, &self.model, &response)?;
        }

        Ok(response)
    }

    /// Query with a single user message and an optional system prompt,
    /// returning the response text with `<think>` spans removed.
    pub async fn simple_query(
        &self,
        human_message: &str,
        system_prompt: Option<&str>,
    ) -> Result<String> {
        let response = self.simple_query_raw(human_message, system_prompt).await?;
        Ok(strip_thinking_tokens(&response.content))
    }

    /// Query with a single user message and an optional system prompt,
    /// returning the full response.
    pub async fn simple_query_raw(
        &self,
        human_message: &str,
        system_prompt: Option<&str>,
    ) -> Result<CompletionResponse> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(human_message));
        self.query(&messages).await
    }

    /// Terminate an owned inference server. No-op for providers without one
    /// or when the server is hosted externally.
    pub fn shutdown_server(&mut self) -> Result<()> {
        match self.server.as_mut() {
            Some(server) => server.shutdown(),
            None => Ok(()),
        }
    }
}

/// Resolve the API key for a provider: an explicit key is used as-is,
/// otherwise the provider's environment variable is read. The environment
/// is never written.
fn resolve_api_key(provider: Provider, explicit: Option<&str>) -> Result<String> {
    // The local inference server does not enforce authentication
    let Some(env_var) = provider.env_key() else {
        return Ok(PLACEHOLDER_API_KEY.to_string());
    };

    if let Some(key) = explicit {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => {
            tracing::info!(%provider, env_var, "resolved API key from environment");
            Ok(value)
        }
        _ => Err(Error::missing_credential(provider, env_var)),
    }
}

fn build_client(
    provider: Provider,
    model: &str,
    api_key: &str,
    params: &GenerationParams,
    base_url_override: Option<String>,
) -> Box<dyn LlmClient> {
    let mut config = ClientConfig::new(api_key)
        .with_default_model(model)
        .with_max_retries(params.max_retries);
    if let Some(secs) = params.timeout_secs {
        config = config.with_timeout(secs);
    }
    if let Some(url) = base_url_override {
        config = config.with_base_url(url);
    }

    match provider {
        Provider::Anthropic => Box::new(AnthropicClient::new(config)),
        Provider::Google => Box::new(GoogleClient::new(config)),
        Provider::OpenAI => Box::new(OpenAiCompatClient::openai(config)),
        Provider::TogetherAI => Box::new(OpenAiCompatClient::together(config)),
        Provider::Vllm => Box::new(OpenAiCompatClient::vllm(config)),
    }
}

static THINK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("invalid regex"));

/// Remove every `<think>...</think>` span (case-insensitive, spanning
/// newlines) and trim surrounding whitespace.
pub fn strip_thinking_tokens(text: &str) -> String {
    THINK_SPAN.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{StopReason, TokenUsage};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    async fn orchestrator(provider: Provider) -> QueryOrchestrator {
        let mut config = OrchestratorConfig::new(provider, "test-model").with_api_key("test-key");
        if provider == Provider::Vllm {
            config = config.with_external_server();
        }
        QueryOrchestrator::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_construction_for_all_providers() {
        for provider in Provider::ALL {
            let orch = orchestrator(provider).await;
            assert_eq!(orch.provider(), provider);
            assert_eq!(orch.system_tag(), "system");
            assert_eq!(orch.user_tag(), "human");
        }
    }

    #[tokio::test]
    async fn test_explicit_api_key_is_kept() {
        let orch = QueryOrchestrator::new(
            OrchestratorConfig::new(Provider::Anthropic, "claude-3-5-haiku")
                .with_api_key("sk-ant-explicit"),
        )
        .await
        .unwrap();
        assert_eq!(orch.api_key(), "sk-ant-explicit");
    }

    #[tokio::test]
    async fn test_api_key_resolved_from_environment() {
        std::env::set_var("TOGETHER_API_KEY", "tok-from-env");
        let orch =
            QueryOrchestrator::new(OrchestratorConfig::new(Provider::TogetherAI, "test-model"))
                .await
                .unwrap();
        assert_eq!(orch.api_key(), "tok-from-env");
    }

    #[tokio::test]
    async fn test_missing_credential_fails_construction() {
        std::env::remove_var("GOOGLE_API_KEY");
        let err =
            QueryOrchestrator::new(OrchestratorConfig::new(Provider::Google, "gemini-2.0-flash"))
                .await
                .unwrap_err();
        assert!(matches!(err, Error::MissingCredential { ref env_var, .. }
            if env_var == "GOOGLE_API_KEY"));
    }

    #[tokio::test]
    async fn test_vllm_external_server_uses_placeholder_key() {
        let mut orch = QueryOrchestrator::new(
            OrchestratorConfig::new(Provider::Vllm, "facebook/opt-125m").with_external_server(),
        )
        .await
        .unwrap();

        assert_eq!(orch.api_key(), PLACEHOLDER_API_KEY);
        assert_eq!(orch.server_pid(), None);
        assert!(orch.shutdown_server().is_ok());
    }

    #[tokio::test]
    async fn test_wrap_preserves_order_and_drops_other_roles() {
        let orch = orchestrator(Provider::OpenAI).await;

        let wrapped = orch.wrap_messages(&[
            ChatMessage::system("S"),
            ChatMessage::assistant("ignored"),
            ChatMessage::user("U"),
        ]);

        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[0].role, ChatRole::System);
        assert_eq!(wrapped[0].content, "S");
        assert_eq!(wrapped[1].role, ChatRole::User);
        assert_eq!(wrapped[1].content, "U");
    }

    #[tokio::test]
    async fn test_cache_name_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("mycache").to_string_lossy().into_owned();

        let orch = QueryOrchestrator::new(
            OrchestratorConfig::new(Provider::OpenAI, "gpt-4o")
                .with_api_key("sk-test")
                .with_cache(&name),
        )
        .await
        .unwrap();

        let path = orch.cache_path().unwrap().to_string_lossy().into_owned();
        assert!(path.ends_with("mycache.db"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_short_circuits_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("responses").to_string_lossy().into_owned();

        let orch = QueryOrchestrator::new(
            OrchestratorConfig::new(Provider::OpenAI, "gpt-4o")
                .with_api_key("sk-test")
                .with_delay(3)
                .with_cache(&name),
        )
        .await
        .unwrap();

        // Seed the cache file through a second handle
        let messages = vec![ChatMessage::user("hello")];
        let fingerprint = request_fingerprint(Provider::OpenAI, "gpt-4o", &messages);
        let seeded = CompletionResponse {
            id: "cached-1".to_string(),
            model: "gpt-4o".to_string(),
            content: "stored answer".to_string(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage::default(),
            timestamp: Utc::now(),
        };
        ResponseCache::open(&name)
            .unwrap()
            .put(&fingerprint, Provider::OpenAI, "gpt-4o", &seeded)
            .unwrap();

        // No network dispatch happens on a hit, so this succeeds offline;
        // the paused clock auto-advances through the pre-call delay.
        let response = orch.query(&messages).await.unwrap();
        assert_eq!(response.id, "cached-1");
        assert_eq!(response.content, "stored answer");
    }

    #[test]
    fn test_strip_thinking_tokens() {
        assert_eq!(strip_thinking_tokens("a<think>ignore</think>b"), "ab");
        assert_eq!(strip_thinking_tokens("  plain text  "), "plain text");
        assert_eq!(
            strip_thinking_tokens("<THINK>one</THINK>x<think>\ntwo\n</think>y"),
            "xy"
        );
        assert_eq!(strip_thinking_tokens("<think>only</think>"), "");
    }

    #[test]
    fn test_strip_thinking_tokens_unclosed_tag_left_alone() {
        assert_eq!(strip_thinking_tokens("a<think>dangling"), "a<think>dangling");
    }
}
