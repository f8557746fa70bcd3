//! Error types for llm-dispatch.

use thiserror::Error;

/// Result type alias using llm-dispatch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing an orchestrator or dispatching
/// a query.
#[derive(Error, Debug)]
pub enum Error {
    /// Provider name outside the recognized set
    #[error("invalid provider '{0}': must be one of google, openai, togetherai, anthropic, vllm")]
    InvalidProvider(String),

    /// No API key supplied and none found in the environment
    #[error("missing credential for {provider}: pass an API key or set {env_var}")]
    MissingCredential { provider: String, env_var: String },

    /// Failure surfaced by a provider client during dispatch
    #[error("provider call error: {provider} - {message}")]
    ProviderCall { provider: String, message: String },

    /// Response cache error
    #[error("response cache error: {0}")]
    Cache(String),

    /// Inference server lifecycle error
    #[error("inference server error: {0}")]
    Server(String),

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a missing-credential error.
    pub fn missing_credential(provider: impl ToString, env_var: impl Into<String>) -> Self {
        Self::MissingCredential {
            provider: provider.to_string(),
            env_var: env_var.into(),
        }
    }

    /// Create a provider call error.
    pub fn provider_call(provider: impl ToString, message: impl Into<String>) -> Self {
        Self::ProviderCall {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_provider_message_lists_valid_set() {
        let err = Error::InvalidProvider("mistral".to_string());
        let msg = err.to_string();
        assert!(msg.contains("mistral"));
        assert!(msg.contains("togetherai"));
        assert!(msg.contains("vllm"));
    }

    #[test]
    fn test_missing_credential_names_env_var() {
        let err = Error::missing_credential("openai", "OPENAI_API_KEY");
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
