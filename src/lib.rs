//! # llm-dispatch
//!
//! Multi-provider LLM query dispatch with local inference server management.
//!
//! ## Core Components
//!
//! - **Orchestrator**: provider selection, credential resolution, message
//!   wrapping, and query dispatch
//! - **Clients**: native wire formats for Anthropic and Gemini, plus one
//!   OpenAI-compatible client shared by OpenAI, TogetherAI, and vLLM
//! - **Cache**: SQLite-backed response cache keyed by request fingerprint
//! - **Server**: scoped lifecycle for a locally spawned vLLM subprocess
//!
//! ## Example
//!
//! ```rust,ignore
//! use llm_dispatch::{ChatMessage, OrchestratorConfig, Provider, QueryOrchestrator};
//!
//! let orchestrator = QueryOrchestrator::new(
//!     OrchestratorConfig::new(Provider::OpenAI, "gpt-4o").with_cache("responses"),
//! )
//! .await?;
//!
//! let response = orchestrator
//!     .query(&[
//!         ChatMessage::system("Answer briefly."),
//!         ChatMessage::user("What is backpressure?"),
//!     ])
//!     .await?;
//! println!("{}", response.content);
//! ```

pub mod error;
pub mod llm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use llm::{
    image_base64, image_data_uri, normalize_cache_name, request_fingerprint, sha256_hex,
    strip_thinking_tokens, AnthropicClient, ChatMessage, ChatRole, ClientConfig,
    CompletionRequest, CompletionResponse, GenerationParams, GoogleClient, InferenceServer,
    LlmClient, OpenAiCompatClient, OrchestratorConfig, Provider, QueryOrchestrator,
    ResponseCache, ServerConfig, ServerState, StopReason, TokenUsage, LOCAL_INFERENCE_URL,
    PLACEHOLDER_API_KEY,
};
