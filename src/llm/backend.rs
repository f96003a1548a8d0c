//! Inference backend capability consumed by pipeline stages.
//!
//! Stages see a single operation, `complete(prompt, config) -> text`. Three
//! implementations sit behind [`InferenceBackend`]:
//!
//! - [`ProviderBackend`] adapts any chat-completion [`LlmProvider`]
//!   (the HTTP [`super::LiteLlmClient`] in `real` mode)
//! - [`super::MockBackend`] answers deterministically in `mock` mode
//! - [`SerializedBackend`] wraps either one and limits how many calls reach
//!   the model at once, queuing the rest in FIFO order

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::pipeline::config::ConfigError;
use crate::pipeline::StageId;

use super::litellm::{GenerationRequest, LlmProvider, Message};

/// Per-call inference settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Context window of the loaded model, in tokens.
    pub context_window: u32,
    /// Prompt-processing batch size.
    pub batch_size: u32,
    /// Sampling temperature. Kept low for near-deterministic code.
    pub temperature: f64,
    /// Maximum tokens to generate per call.
    pub max_tokens: u32,
    /// Nucleus sampling parameter.
    pub top_p: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_window: 8192,
            batch_size: 512,
            temperature: 0.1,
            max_tokens: 4096,
            top_p: 0.95,
        }
    }
}

impl GenerationConfig {
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_batch_size(mut self, batch: u32) -> Self {
        self.batch_size = batch;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    /// Validates the generation settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "context_window must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.max_tokens == 0 || self.max_tokens > self.context_window {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be between 1 and context_window".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.top_p) || self.top_p == 0.0 {
            return Err(ConfigError::ValidationFailed(
                "top_p must be in (0.0, 1.0]".to_string(),
            ));
        }

        Ok(())
    }
}

/// A prompt addressed to the backend on behalf of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Stage issuing the call.
    pub stage: StageId,
    /// Role and output contract.
    pub system: String,
    /// Task-specific content.
    pub user: String,
}

impl Prompt {
    pub fn new(stage: StageId, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            stage,
            system: system.into(),
            user: user.into(),
        }
    }

    /// Rough token count of the whole prompt (four bytes per token).
    pub fn approx_tokens(&self) -> usize {
        (self.system.len() + self.user.len()).div_ceil(4)
    }
}

/// Text-completion capability shared by every stage.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Completes `prompt` under `config`, returning the raw model text.
    async fn complete(&self, prompt: &Prompt, config: &GenerationConfig)
        -> Result<String, LlmError>;

    /// Short identifier used in logs and generated documentation.
    fn name(&self) -> &str;
}

/// Adapts a chat-completion provider to [`InferenceBackend`].
pub struct ProviderBackend {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ProviderBackend {
    /// Creates a backend calling `model` through `provider`.
    ///
    /// An empty model name lets the provider use its default.
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for ProviderBackend {
    async fn complete(
        &self,
        prompt: &Prompt,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        if prompt.approx_tokens() > config.context_window as usize {
            return Err(LlmError::ContextLengthExceeded {
                limit: config.context_window,
            });
        }

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(prompt.system.clone()),
                Message::user(prompt.user.clone()),
            ],
        )
        .with_sampling(config.temperature, config.max_tokens, config.top_p);

        let response = self.provider.generate(&request).await?;
        let content = response.content.trim();

        if content.is_empty() {
            return Err(LlmError::EmptyResponse(response.model.clone()));
        }
        if response.is_truncated() {
            warn!(
                stage = %prompt.stage,
                max_tokens = config.max_tokens,
                "Completion hit the token limit"
            );
        }

        debug!(
            stage = %prompt.stage,
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "Provider call completed"
        );

        Ok(content.to_string())
    }

    fn name(&self) -> &str {
        if self.model.is_empty() {
            "provider"
        } else {
            &self.model
        }
    }
}

/// Statistics about a serialized backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Configured concurrent slots.
    pub slots: usize,
    /// Calls that returned text.
    pub calls_completed: u64,
    /// Calls that returned an error.
    pub calls_failed: u64,
    /// Total time spent waiting for a slot, in milliseconds.
    pub total_wait_ms: u64,
}

#[derive(Default)]
struct SharedBackendStats {
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Serializes access to a scarce backend across concurrent jobs.
///
/// Holds a semaphore with `slots` permits; tokio's semaphore grants permits
/// in request order, so waiting calls are served FIFO. Dropping a waiting
/// call (e.g. on cancellation) leaves the queue without side effects.
#[derive(Clone)]
pub struct SerializedBackend {
    inner: Arc<dyn InferenceBackend>,
    permits: Arc<Semaphore>,
    slots: usize,
    stats: Arc<SharedBackendStats>,
}

impl SerializedBackend {
    /// Wraps `inner`, allowing at most `slots` concurrent calls (minimum 1).
    pub fn new(inner: Arc<dyn InferenceBackend>, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(slots)),
            slots,
            stats: Arc::new(SharedBackendStats::default()),
        }
    }

    /// Number of slots currently free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Returns a snapshot of call statistics.
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            slots: self.slots,
            calls_completed: self.stats.calls_completed.load(Ordering::SeqCst),
            calls_failed: self.stats.calls_failed.load(Ordering::SeqCst),
            total_wait_ms: self.stats.total_wait_ms.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl InferenceBackend for SerializedBackend {
    async fn complete(
        &self,
        prompt: &Prompt,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        let queued_at = Instant::now();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Unavailable("backend slot pool closed".to_string()))?;

        let waited: Duration = queued_at.elapsed();
        self.stats
            .total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::SeqCst);
        debug!(stage = %prompt.stage, waited_ms = waited.as_millis() as u64, "Backend slot acquired");

        let result = self.inner.complete(prompt, config).await;
        match &result {
            Ok(_) => self.stats.calls_completed.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.stats.calls_failed.fetch_add(1, Ordering::SeqCst),
        };
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
