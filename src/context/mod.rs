//! Size-adapted context preparation for a bounded-context backend.
//!
//! The [`ContextManager`] classifies a source document by estimated token
//! count and prepares it once per job with one of three strategies:
//!
//! | tokens                        | strategy    | payload                                   |
//! |-------------------------------|-------------|-------------------------------------------|
//! | `< small_threshold`           | `direct`    | the text, unchanged                       |
//! | `small..=large_threshold`     | `windowed`  | overlapping chunks with offsets           |
//! | `> large_threshold`           | `retrieval` | an index, queried per stage objective     |
//!
//! Stages ask the prepared context for a [`ContextView`] framed by their
//! [`StageObjective`]. For retrieval, the view pairs the top-K segments for
//! that objective with a hierarchical summary of every other segment.
//!
//! If the estimator cannot measure the input, the manager falls back to the
//! windowed strategy over content-blind spans and records a warning.

pub mod config;
pub mod retrieval;
pub mod summary;
pub mod tokens;
pub mod window;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ContextError;
use crate::pipeline::config::ConfigError;

pub use config::ContextConfig;
pub use retrieval::{
    HashEmbedder, HashEmbeddingIndex, IndexHandle, RetrievalIndex, ScoredSegment, Segment,
    SegmentKind,
};
pub use summary::{HierarchicalSummarizer, SummaryNode};
pub use tokens::{HeuristicTokenizer, TokenEstimator, TokenSpan};
pub use window::{chunk_text, reassemble, Chunk};

/// Characters per span when the estimator rejects the input.
const FALLBACK_CHARS_PER_TOKEN: usize = 4;

/// Feeding strategy chosen for a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    #[default]
    Direct,
    Windowed,
    Retrieval,
}

impl ContextStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStrategy::Direct => "direct",
            ContextStrategy::Windowed => "windowed",
            ContextStrategy::Retrieval => "retrieval",
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks a strategy from a token count.
///
/// Pure: `tokens < small` is direct, `small <= tokens <= large` is windowed,
/// `tokens > large` is retrieval.
pub fn select_strategy(tokens: usize, config: &ContextConfig) -> ContextStrategy {
    if tokens < config.small_threshold {
        ContextStrategy::Direct
    } else if tokens <= config.large_threshold {
        ContextStrategy::Windowed
    } else {
        ContextStrategy::Retrieval
    }
}

/// What a stage wants from the source, used to frame retrieval queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageObjective {
    Extraction,
    Generation,
    Validation,
    Documentation,
}

impl StageObjective {
    fn framing(&self) -> &'static str {
        match self {
            StageObjective::Extraction => {
                "class struct interface function method constructor destructor new delete malloc free pointer ownership resource loop branch"
            }
            StageObjective::Generation => {
                "function body algorithm loop compute return buffer allocate release read write"
            }
            StageObjective::Validation => {
                "input output return value error check boundary exception assert null size"
            }
            StageObjective::Documentation => {
                "class public interface purpose overview comment main entry"
            }
        }
    }

    /// Query text: the objective's framing plus stage-specific focus terms.
    pub fn query(&self, focus: &[String]) -> String {
        let mut query = self.framing().to_string();
        for term in focus {
            query.push(' ');
            query.push_str(term);
        }
        query
    }
}

/// Keeps one document in the index; releases it when the last clone drops.
struct IndexLease {
    handle: IndexHandle,
    index: Arc<dyn RetrievalIndex>,
}

impl Drop for IndexLease {
    fn drop(&mut self) {
        match self.index.release(self.handle) {
            Ok(()) => debug!(handle = self.handle.0, "Retrieval index released"),
            Err(e) => warn!(handle = self.handle.0, error = %e, "Failed to release retrieval index"),
        }
    }
}

/// Retrieval state shared by every view of one prepared document.
#[derive(Clone)]
pub struct RetrievalPayload {
    lease: Arc<IndexLease>,
    summarizer: HierarchicalSummarizer,
    top_k: usize,
    segment_count: usize,
}

impl fmt::Debug for RetrievalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalPayload")
            .field("handle", &self.lease.handle)
            .field("top_k", &self.top_k)
            .field("segment_count", &self.segment_count)
            .finish()
    }
}

impl RetrievalPayload {
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Retrieves the top-K segments for `query` and summarizes the rest.
    pub fn retrieve(&self, query: String) -> Result<RetrievedView, ContextError> {
        let IndexLease { handle, index } = &*self.lease;
        let retrieved = index.search(*handle, &query, self.top_k)?;
        let all = index.segments(*handle)?;

        let rest: Vec<&Segment> = all
            .iter()
            .filter(|s| !retrieved.iter().any(|r| r.segment.id == s.id))
            .collect();
        let summaries = self.summarizer.summarize(&rest)?;

        Ok(RetrievedView {
            query,
            retrieved,
            summaries,
        })
    }
}

/// Strategy-specific payload.
#[derive(Debug, Clone)]
pub enum ContextPayload {
    Direct { text: String },
    Windowed { chunks: Vec<Chunk> },
    Retrieval(RetrievalPayload),
}

/// A document prepared for the pipeline. Immutable once built.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    strategy: ContextStrategy,
    token_estimate: Option<usize>,
    warnings: Vec<String>,
    payload: ContextPayload,
}

impl PreparedContext {
    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    /// Estimated token count, or `None` if estimation failed.
    pub fn token_estimate(&self) -> Option<usize> {
        self.token_estimate
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn payload(&self) -> &ContextPayload {
        &self.payload
    }

    /// Chunks of a windowed document; empty for other strategies.
    pub fn chunks(&self) -> &[Chunk] {
        match &self.payload {
            ContextPayload::Windowed { chunks } => chunks,
            _ => &[],
        }
    }

    /// A view of the source framed for `objective`.
    pub fn view(
        &self,
        objective: StageObjective,
        focus: &[String],
    ) -> Result<ContextView<'_>, ContextError> {
        match &self.payload {
            ContextPayload::Direct { text } => Ok(ContextView::Full(text)),
            ContextPayload::Windowed { chunks } => Ok(ContextView::Windows(chunks)),
            ContextPayload::Retrieval(payload) => {
                let view = payload.retrieve(objective.query(focus))?;
                debug!(
                    objective = ?objective,
                    retrieved = view.retrieved.len(),
                    summaries = view.summaries.len(),
                    "Retrieval view built"
                );
                Ok(ContextView::Retrieved(view))
            }
        }
    }
}

/// Retrieved segments plus summaries of everything not retrieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedView {
    pub query: String,
    pub retrieved: Vec<ScoredSegment>,
    pub summaries: Vec<SummaryNode>,
}

/// What a stage sees of the source.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextView<'a> {
    Full(&'a str),
    Windows(&'a [Chunk]),
    Retrieved(RetrievedView),
}

impl ContextView<'_> {
    /// Renders the view as prompt text.
    ///
    /// Windows render as an index of line ranges; stages that need their
    /// content iterate the chunks directly.
    pub fn render(&self) -> String {
        match self {
            ContextView::Full(text) => (*text).to_string(),
            ContextView::Windows(chunks) => {
                let mut out = format!(
                    "(source provided as {} overlapping windows)\n",
                    chunks.len()
                );
                for chunk in chunks.iter() {
                    out.push_str(&format!(
                        "- window {}: lines {}-{}\n",
                        chunk.index + 1,
                        chunk.start_line,
                        chunk.end_line
                    ));
                }
                out
            }
            ContextView::Retrieved(view) => {
                let mut out = String::new();
                for (rank, hit) in view.retrieved.iter().enumerate() {
                    out.push_str(&format!(
                        "### Retrieved segment {} (lines {}-{}, score {:.3})\n{}\n",
                        rank + 1,
                        hit.segment.start_line,
                        hit.segment.end_line,
                        hit.score,
                        hit.segment.text.trim_end()
                    ));
                }
                if !view.summaries.is_empty() {
                    out.push_str("### Summary of remaining segments\n");
                    for node in &view.summaries {
                        out.push_str(&format!(
                            "[lines {}-{}]\n{}\n",
                            node.start_line, node.end_line, node.text
                        ));
                    }
                }
                out
            }
        }
    }
}

/// Chooses and builds the feeding strategy for a document.
#[derive(Clone)]
pub struct ContextManager {
    config: ContextConfig,
    estimator: Arc<dyn TokenEstimator>,
    index: Arc<dyn RetrievalIndex>,
    /// Set by `with_index`; the default index follows the estimator.
    custom_index: bool,
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .field("estimator", &self.estimator.name())
            .finish()
    }
}

impl ContextManager {
    /// Creates a manager with the heuristic tokenizer and hashed-embedding index.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` is invalid.
    pub fn new(config: ContextConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let estimator: Arc<dyn TokenEstimator> = Arc::new(HeuristicTokenizer::default());
        let index = default_index(&config, &estimator);
        Ok(Self {
            config,
            estimator,
            index,
            custom_index: false,
        })
    }

    /// Replaces the token estimator. The built-in index is rebuilt so its
    /// segments are sized with the same estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        if !self.custom_index {
            self.index = default_index(&self.config, &estimator);
        }
        self.estimator = estimator;
        self
    }

    /// Replaces the retrieval index.
    pub fn with_index(mut self, index: Arc<dyn RetrievalIndex>) -> Self {
        self.index = index;
        self.custom_index = true;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Prepares `text` for the pipeline.
    ///
    /// # Errors
    ///
    /// Fails only if chunking or indexing fails. An estimation failure, or
    /// spans that do not tile `text`, fall back to the windowed strategy.
    pub fn prepare(&self, text: &str) -> Result<PreparedContext, ContextError> {
        let mut warnings = Vec::new();

        let measured = self.estimator.tokenize(text).and_then(|spans| {
            tokens::check_tiling(text, &spans)?;
            Ok(spans)
        });
        let (spans, token_estimate, strategy) = match measured {
            Ok(spans) => {
                let tokens = spans.len();
                (spans, Some(tokens), select_strategy(tokens, &self.config))
            }
            Err(e) => {
                let message = format!("token estimation failed ({}); falling back to windowed", e);
                warn!(estimator = self.estimator.name(), error = %e, "Token estimation failed, using windowed strategy");
                warnings.push(message);
                (
                    tokens::fallback_spans(text, FALLBACK_CHARS_PER_TOKEN),
                    None,
                    ContextStrategy::Windowed,
                )
            }
        };

        let payload = match strategy {
            ContextStrategy::Direct => ContextPayload::Direct {
                text: text.to_string(),
            },
            ContextStrategy::Windowed => ContextPayload::Windowed {
                chunks: chunk_text(
                    text,
                    &spans,
                    self.config.chunk_size,
                    self.config.chunk_overlap,
                )?,
            },
            ContextStrategy::Retrieval => {
                let lease = Arc::new(IndexLease {
                    handle: self.index.index(text)?,
                    index: self.index.clone(),
                });
                let segment_count = self.index.segments(lease.handle)?.len();
                ContextPayload::Retrieval(RetrievalPayload {
                    lease,
                    summarizer: HierarchicalSummarizer::new(
                        self.config.summary_group_size,
                        self.config.summary_max_tokens,
                        self.estimator.clone(),
                    ),
                    top_k: self.config.top_k,
                    segment_count,
                })
            }
        };

        info!(
            strategy = %strategy,
            tokens = ?token_estimate,
            "Context prepared"
        );

        Ok(PreparedContext {
            strategy,
            token_estimate,
            warnings,
            payload,
        })
    }
}

fn default_index(
    config: &ContextConfig,
    estimator: &Arc<dyn TokenEstimator>,
) -> Arc<dyn RetrievalIndex> {
    Arc::new(
        HashEmbeddingIndex::new(config.embedding_dimension, config.chunk_size)
            .with_estimator(estimator.clone()),
    )
}
