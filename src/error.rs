//! Error types for the annotext pipeline
//!
//! Only document-level and run-level problems are surfaced through this type.
//! Chunk-level and candidate-level problems are absorbed by the pipeline and
//! counted in [`crate::types::RunDiagnostics`] instead.

use thiserror::Error;

/// Main error type for annotext operations
#[derive(Error, Debug)]
pub enum AnnotextError {
    /// Completion provider returned a non-success response
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single completion call exceeded its timeout
    #[error("Completion call timed out after {0}s")]
    Timeout(u64),

    /// Provider signalled rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Provider output could not be parsed into the expected structure
    #[error("Malformed completion output: {0}")]
    MalformedResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document not found in the store
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Document has no text to analyze
    #[error("Document is empty: {0}")]
    EmptyDocument(String),

    /// Prompt list or prompt text rejected
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Run produced no usable chunk output
    #[error("Analysis run {run_id} failed: {reason} ({failed_chunks}/{sampled_chunks} chunks failed)")]
    RunFailed {
        run_id: String,
        reason: String,
        failed_chunks: usize,
        sampled_chunks: usize,
    },

    /// Every configured provider failed for one request
    #[error("All completion providers failed: {}", .0.join("; "))]
    AllProvidersFailed(Vec<String>),

    /// Work was abandoned because the run was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl AnnotextError {
    /// Whether a completion call failing with this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            AnnotextError::Timeout(_)
            | AnnotextError::RateLimited(_)
            | AnnotextError::MalformedResponse(_) => true,
            AnnotextError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(true)
            }
            AnnotextError::LlmApi(msg) => msg.contains("status 5"),
            // Fallback surfaces a flattened list, so any transient marker keeps it retryable
            AnnotextError::AllProvidersFailed(errors) => errors.iter().any(|e| e.contains("[retryable]")),
            _ => false,
        }
    }
}

/// Result type alias for annotext operations
pub type Result<T> = std::result::Result<T, AnnotextError>;

/// Convert anyhow::Error to AnnotextError
impl From<anyhow::Error> for AnnotextError {
    fn from(err: anyhow::Error) -> Self {
        AnnotextError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for AnnotextError {
    fn from(err: toml::de::Error) -> Self {
        AnnotextError::Config(format!("Failed to parse config file: {}", err))
    }
}
