//! Multi-provider query orchestration.
//!
//! This module provides a unified interface for querying multiple LLM
//! providers (Google, OpenAI, TogetherAI, Anthropic, and a locally hosted
//! vLLM server) with credential resolution, optional response caching, and
//! inference-server lifecycle management.
//!
//! ## Example
//!
//! ```rust,ignore
//! use llm_dispatch::{OrchestratorConfig, Provider, QueryOrchestrator};
//!
//! let orchestrator = QueryOrchestrator::new(
//!     OrchestratorConfig::new(Provider::Anthropic, "claude-3-5-sonnet-20241022")
//!         .with_cache("responses"),
//! )
//! .await?;
//!
//! let answer = orchestrator
//!     .simple_query("What is a monad?", Some("Answer in one sentence."))
//!     .await?;
//! ```

mod cache;
mod client;
mod orchestrator;
mod server;
mod types;

pub use cache::{normalize_cache_name, request_fingerprint, sha256_hex, ResponseCache};
pub use client::{
    AnthropicClient, ClientConfig, GoogleClient, LlmClient, OpenAiCompatClient,
    LOCAL_INFERENCE_URL, PLACEHOLDER_API_KEY,
};
pub use orchestrator::{strip_thinking_tokens, OrchestratorConfig, QueryOrchestrator};
pub use server::{InferenceServer, ServerConfig, ServerState};
pub use types::{
    image_base64, image_data_uri, ChatMessage, ChatRole, CompletionRequest, CompletionResponse,
    GenerationParams, Provider, StopReason, TokenUsage,
};
