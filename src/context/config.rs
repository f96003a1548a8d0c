//! Context manager configuration.

use crate::pipeline::config::{parse_env_value, ConfigError};

/// Thresholds and sizes for the three feeding strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Inputs below this many tokens are passed through unchanged.
    pub small_threshold: usize,
    /// Inputs above this many tokens go through retrieval.
    pub large_threshold: usize,
    /// Tokens per window.
    pub chunk_size: usize,
    /// Tokens shared by adjacent windows.
    pub chunk_overlap: usize,
    /// Segments retrieved per view.
    pub top_k: usize,
    /// Fan-in of the summary tree.
    pub summary_group_size: usize,
    /// Token budget of one summary node.
    pub summary_max_tokens: usize,
    /// Width of segment embeddings.
    pub embedding_dimension: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            small_threshold: 4_000,
            large_threshold: 16_000,
            chunk_size: 512,
            chunk_overlap: 64,
            top_k: 5,
            summary_group_size: 4,
            summary_max_tokens: 256,
            embedding_dimension: 128,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from `FORGE_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_SMALL_THRESHOLD` (default: 4000)
    /// - `FORGE_LARGE_THRESHOLD` (default: 16000)
    /// - `FORGE_CHUNK_SIZE` (default: 512)
    /// - `FORGE_CHUNK_OVERLAP` (default: 64)
    /// - `FORGE_TOP_K` (default: 5)
    /// - `FORGE_SUMMARY_GROUP_SIZE` (default: 4)
    /// - `FORGE_SUMMARY_MAX_TOKENS` (default: 256)
    /// - `FORGE_EMBEDDING_DIMENSION` (default: 128)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let fields: [(&str, &mut usize); 8] = [
            ("FORGE_SMALL_THRESHOLD", &mut config.small_threshold),
            ("FORGE_LARGE_THRESHOLD", &mut config.large_threshold),
            ("FORGE_CHUNK_SIZE", &mut config.chunk_size),
            ("FORGE_CHUNK_OVERLAP", &mut config.chunk_overlap),
            ("FORGE_TOP_K", &mut config.top_k),
            ("FORGE_SUMMARY_GROUP_SIZE", &mut config.summary_group_size),
            ("FORGE_SUMMARY_MAX_TOKENS", &mut config.summary_max_tokens),
            ("FORGE_EMBEDDING_DIMENSION", &mut config.embedding_dimension),
        ];

        for (key, field) in fields {
            if let Some(val) = lookup(key) {
                *field = parse_env_value(&val, key)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates thresholds and sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.small_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "small_threshold must be greater than 0".to_string(),
            ));
        }

        if self.large_threshold < self.small_threshold {
            return Err(ConfigError::ValidationFailed(
                "large_threshold must not be below small_threshold".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::ValidationFailed(
                "chunk_overlap must be smaller than chunk_size".to_string(),
            ));
        }

        if self.top_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "top_k must be greater than 0".to_string(),
            ));
        }

        if self.summary_group_size < 2 {
            return Err(ConfigError::ValidationFailed(
                "summary_group_size must be at least 2".to_string(),
            ));
        }

        if self.summary_max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "summary_max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.embedding_dimension < 8 {
            return Err(ConfigError::ValidationFailed(
                "embedding_dimension must be at least 8".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_thresholds(mut self, small: usize, large: usize) -> Self {
        self.small_threshold = small;
        self.large_threshold = large;
        self
    }

    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size;
        self.chunk_overlap = overlap;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_summary(mut self, group_size: usize, max_tokens: usize) -> Self {
        self.summary_group_size = group_size;
        self.summary_max_tokens = max_tokens;
        self
    }

    pub fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }
}
