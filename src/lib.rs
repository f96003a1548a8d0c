//! legacy-forge: staged LLM pipeline for modernizing legacy source code.
//!
//! A legacy C++ or Java file is sized by the [`context`] manager, then moved
//! through the [`pipeline`] stages implemented in [`agents`]. Jobs are
//! submitted and tracked through the [`scheduler`].

// Core modules
pub mod agents;
pub mod cli;
pub mod context;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod scheduler;
pub mod utils;

// Re-export commonly used error types
pub use agents::StageError;
pub use error::{ContextError, LlmError, StateError};
pub use pipeline::ConfigError;
pub use scheduler::SchedulerError;
