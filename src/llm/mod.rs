//! Inference backend integration for legacy-forge.
//!
//! Stages talk to a model through the [`InferenceBackend`] capability. The
//! concrete backend is chosen per job (`mock` or `real`) and injected into
//! the orchestrator; nothing in the pipeline reads a global model flag.
//!
//! ```ignore
//! use legacy_forge::llm::{LiteLlmClient, ProviderBackend, SerializedBackend};
//! use std::sync::Arc;
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let backend = SerializedBackend::new(Arc::new(ProviderBackend::new(client, "")), 1);
//! ```

pub mod backend;
pub mod litellm;
pub mod mock;

pub use backend::{
    BackendStats, GenerationConfig, InferenceBackend, Prompt, ProviderBackend, SerializedBackend,
};
pub use litellm::{
    ClientSettings, FinishReason, GenerationRequest, GenerationResponse, LiteLlmClient,
    LlmProvider, Message, Role, Usage,
};
pub use mock::{MockBackend, MockFailure};
