//! Error types for legacy-forge operations.
//!
//! Defines the error types shared across subsystems:
//! - Inference backend interactions
//! - Context preparation (token estimation, chunking, retrieval)
//! - Pipeline state mutation
//!
//! Stage-local failures live in [`crate::agents::error`], configuration
//! failures in [`crate::pipeline::config`].

use thiserror::Error;

/// Errors that can occur during inference backend operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty response from model '{0}'")]
    EmptyResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while preparing a size-adapted view of a document.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The token estimate could not be computed for the input.
    #[error("Token estimation failed: {0}")]
    Estimation(String),

    /// The document could not be indexed for retrieval.
    #[error("Indexing failed: {0}")]
    Indexing(String),

    /// A retrieval handle did not belong to the index it was used with.
    #[error("Unknown index handle: {0}")]
    UnknownHandle(u64),

    /// Chunking parameters are unusable.
    #[error("Invalid chunking parameters: size {size}, overlap {overlap}")]
    InvalidChunking { size: usize, overlap: usize },
}

/// Errors raised when a mutation would violate a pipeline state invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The state reached `completed` or `failed` and is frozen.
    #[error("State is frozen in terminal status '{0}'")]
    Frozen(String),

    /// A forward-only field was written a second time.
    #[error("Field '{0}' is already set and cannot be overwritten")]
    AlreadySet(&'static str),

    /// A field was committed before the field it depends on.
    #[error("Field '{field}' requires '{requires}' to be set first")]
    MissingPrerequisite {
        field: &'static str,
        requires: &'static str,
    },

    /// The retry budget would be exceeded.
    #[error("Retry budget exhausted: {max} retries allowed")]
    RetryBudgetExceeded { max: u32 },

    /// A status transition that the lifecycle does not allow.
    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },
}
