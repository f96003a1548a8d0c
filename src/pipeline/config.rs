//! Pipeline configuration for the orchestrator.
//!
//! This module provides configuration options for a modernization job:
//! retry budget, per-stage timeout, inference backend capacity, target
//! language and the per-call generation settings.
//!
//! Configuration is validated before any job state exists; an invalid value
//! is a [`ConfigError`], never a pipeline failure.

use std::time::Duration;
use thiserror::Error;

use crate::llm::GenerationConfig;

/// Target languages the generator and validator know how to handle.
pub const SUPPORTED_TARGET_LANGUAGES: &[&str] = &["python"];

/// Errors that can occur during configuration or job submission checks.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A submitted job is missing a required field.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A submitted job names a source language outside the supported set.
    #[error("Unsupported source language '{0}' (expected one of: cpp, java)")]
    UnsupportedLanguage(String),

    /// A submitted job names an unknown execution mode.
    #[error("Unknown execution mode '{0}' (expected mock or real)")]
    UnknownMode(String),

    /// IO error while reading configuration or input.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of failed validations tolerated per job.
    pub max_retries: u32,
    /// Timeout enforced around every stage invocation.
    pub stage_timeout: Duration,
    /// Number of concurrent inference calls the backend can serve.
    pub backend_slots: usize,
    /// Language the generator emits.
    pub target_language: String,
    /// Capacity of the per-job progress channel.
    pub event_buffer: usize,
    /// Settings passed to every inference call.
    pub generation: GenerationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stage_timeout: Duration::from_secs(300),
            backend_slots: 1,
            target_language: "python".to_string(),
            event_buffer: 64,
            generation: GenerationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_MAX_RETRIES`: Retry budget (default: 3)
    /// - `FORGE_STAGE_TIMEOUT_SECS`: Per-stage timeout in seconds (default: 300)
    /// - `FORGE_BACKEND_SLOTS`: Concurrent inference calls (default: 1)
    /// - `FORGE_TARGET_LANGUAGE`: Generated language (default: python)
    /// - `FORGE_EVENT_BUFFER`: Progress channel capacity (default: 64)
    /// - `FORGE_CONTEXT_WINDOW`: Backend context window (default: 8192)
    /// - `FORGE_BATCH_SIZE`: Backend batch size (default: 512)
    /// - `FORGE_TEMPERATURE`: Sampling temperature (default: 0.1)
    /// - `FORGE_MAX_TOKENS`: Maximum generated tokens (default: 4096)
    /// - `FORGE_TOP_P`: Nucleus sampling (default: 0.95)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is unparseable or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    ///
    /// Same keys as [`PipelineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("FORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "FORGE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("FORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FORGE_BACKEND_SLOTS") {
            config.backend_slots = parse_env_value(&val, "FORGE_BACKEND_SLOTS")?;
        }

        if let Some(val) = lookup("FORGE_TARGET_LANGUAGE") {
            config.target_language = val.trim().to_lowercase();
        }

        if let Some(val) = lookup("FORGE_EVENT_BUFFER") {
            config.event_buffer = parse_env_value(&val, "FORGE_EVENT_BUFFER")?;
        }

        // Generation settings
        if let Some(val) = lookup("FORGE_CONTEXT_WINDOW") {
            config.generation.context_window = parse_env_value(&val, "FORGE_CONTEXT_WINDOW")?;
        }

        if let Some(val) = lookup("FORGE_BATCH_SIZE") {
            config.generation.batch_size = parse_env_value(&val, "FORGE_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("FORGE_TEMPERATURE") {
            config.generation.temperature = parse_env_value(&val, "FORGE_TEMPERATURE")?;
        }

        if let Some(val) = lookup("FORGE_MAX_TOKENS") {
            config.generation.max_tokens = parse_env_value(&val, "FORGE_MAX_TOKENS")?;
        }

        if let Some(val) = lookup("FORGE_TOP_P") {
            config.generation.top_p = parse_env_value(&val, "FORGE_TOP_P")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_retries must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if self.backend_slots == 0 {
            return Err(ConfigError::ValidationFailed(
                "backend_slots must be greater than 0".to_string(),
            ));
        }

        if !SUPPORTED_TARGET_LANGUAGES.contains(&self.target_language.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "target_language must be one of: {}",
                SUPPORTED_TARGET_LANGUAGES.join(", ")
            )));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_buffer must be greater than 0".to_string(),
            ));
        }

        self.generation.validate()
    }

    /// Builder method to set the retry budget.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Builder method to set the per-stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to set backend capacity.
    pub fn with_backend_slots(mut self, slots: usize) -> Self {
        self.backend_slots = slots;
        self
    }

    /// Builder method to set the target language.
    pub fn with_target_language(mut self, language: impl Into<String>) -> Self {
        self.target_language = language.into();
        self
    }

    /// Builder method to set the progress channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Builder method to set generation settings.
    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(
    value: &str,
    key: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stage_timeout, Duration::from_secs(300));
        assert_eq!(config.backend_slots, 1);
        assert_eq!(config.target_language, "python");
        assert_eq!(config.generation.context_window, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_max_retries(5)
            .with_stage_timeout(Duration::from_secs(30))
            .with_backend_slots(2)
            .with_event_buffer(8);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stage_timeout, Duration::from_secs(30));
        assert_eq!(config.backend_slots, 2);
        assert_eq!(config.event_buffer, 8);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("FORGE_MAX_RETRIES", "2"),
            ("FORGE_STAGE_TIMEOUT_SECS", "45"),
            ("FORGE_TEMPERATURE", "0.2"),
        ]))
        .unwrap();

        assert_eq!(config.max_retries, 2);
        assert_eq!(config.stage_timeout, Duration::from_secs(45));
        assert!((config.generation.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.backend_slots, 1);
    }

    #[test]
    fn test_from_lookup_unparseable_value() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("FORGE_MAX_RETRIES", "three")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "FORGE_MAX_RETRIES"));
    }

    #[test]
    fn test_from_lookup_rejects_invalid_result() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("FORGE_BACKEND_SLOTS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("backend_slots"));
    }

    #[test]
    fn test_validation_zero_retries() {
        let result = PipelineConfig::default().with_max_retries(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_retries"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let result = PipelineConfig::default()
            .with_stage_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("stage_timeout"));
    }

    #[test]
    fn test_validation_unsupported_target() {
        let result = PipelineConfig::default()
            .with_target_language("cobol")
            .validate();
        assert!(result.unwrap_err().to_string().contains("target_language"));
    }

    #[test]
    fn test_validation_bad_generation_settings() {
        let config = PipelineConfig::default()
            .with_generation(GenerationConfig::default().with_temperature(3.0));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("temperature"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("TEST_VAR".to_string());
        assert!(err.to_string().contains("TEST_VAR"));

        let err = ConfigError::UnsupportedLanguage("rust".to_string());
        assert!(err.to_string().contains("rust"));

        let err = ConfigError::MissingField("file_name");
        assert!(err.to_string().contains("file_name"));
    }
}
