//! Stage-local failures.
//!
//! Every variant is an infrastructure failure and ends the job. Failed
//! validation is not an error: it is a `ValidationResult` that drives the
//! retry edge.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ContextError, LlmError, StateError};
use crate::pipeline::StageId;

/// Short failure category carried into the job's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    BackendUnavailable,
    Timeout,
    MalformedResponse,
    Cancelled,
    Internal,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::BackendUnavailable => "backend_unavailable",
            FailureCategory::Timeout => "timeout",
            FailureCategory::MalformedResponse => "malformed_response",
            FailureCategory::Cancelled => "cancelled",
            FailureCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a stage invocation.
#[derive(Debug, Error)]
pub enum StageError {
    /// The inference backend call failed.
    #[error("{stage}: backend call failed: {source}")]
    Backend {
        stage: StageId,
        #[source]
        source: LlmError,
    },

    /// The stage exceeded its configured timeout.
    #[error("{stage}: timed out after {timeout:?}")]
    Timeout { stage: StageId, timeout: Duration },

    /// The job was cancelled while the stage was running.
    #[error("{stage}: cancelled")]
    Cancelled { stage: StageId },

    /// The backend answered with something the stage cannot use.
    #[error("{stage}: malformed backend response: {reason}")]
    MalformedResponse { stage: StageId, reason: String },

    /// The stage could not obtain its view of the source.
    #[error("{stage}: context unavailable: {source}")]
    Context {
        stage: StageId,
        #[source]
        source: ContextError,
    },

    /// The stage output could not be committed to the state.
    #[error("{stage}: state rejected output: {source}")]
    State {
        stage: StageId,
        #[source]
        source: StateError,
    },

    /// Anything else.
    #[error("{stage}: {message}")]
    Internal { stage: StageId, message: String },
}

/// Result type for stage operations.
pub type StageResult<T> = Result<T, StageError>;

impl StageError {
    pub fn backend(stage: StageId, source: LlmError) -> Self {
        StageError::Backend { stage, source }
    }

    pub fn malformed(stage: StageId, reason: impl Into<String>) -> Self {
        StageError::MalformedResponse {
            stage,
            reason: reason.into(),
        }
    }

    pub fn context(stage: StageId, source: ContextError) -> Self {
        StageError::Context { stage, source }
    }

    /// The stage that raised the error.
    pub fn stage(&self) -> StageId {
        match self {
            StageError::Backend { stage, .. }
            | StageError::Timeout { stage, .. }
            | StageError::Cancelled { stage }
            | StageError::MalformedResponse { stage, .. }
            | StageError::Context { stage, .. }
            | StageError::State { stage, .. }
            | StageError::Internal { stage, .. } => *stage,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            StageError::Backend { source, .. } => match source {
                LlmError::Timeout(_) => FailureCategory::Timeout,
                LlmError::ParseError(_) | LlmError::EmptyResponse(_) => {
                    FailureCategory::MalformedResponse
                }
                _ => FailureCategory::BackendUnavailable,
            },
            StageError::Timeout { .. } => FailureCategory::Timeout,
            StageError::Cancelled { .. } => FailureCategory::Cancelled,
            StageError::MalformedResponse { .. } => FailureCategory::MalformedResponse,
            StageError::Context { .. } | StageError::State { .. } | StageError::Internal { .. } => {
                FailureCategory::Internal
            }
        }
    }
}
