//! Segment index and similarity search for oversized inputs.
//!
//! [`RetrievalIndex`] is the capability the context manager consumes:
//! `index(document) -> handle` and `search(handle, query, k) -> ranked
//! segments`. [`HashEmbeddingIndex`] is the built-in implementation: it
//! segments code at line boundaries and embeds each segment with hashed
//! word and trigram features, so no embedding model is required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use ndarray::{Array1, Array2};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ContextError;

use super::tokens::{HeuristicTokenizer, TokenEstimator};

/// Opaque reference to an indexed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexHandle(pub u64);

/// What a segment mostly contains, judged by its first significant line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Import,
    Class,
    Function,
    Block,
    Other,
}

/// A contiguous run of whole lines from the indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in document order.
    pub id: usize,
    pub start: usize,
    pub end: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: SegmentKind,
    pub token_count: usize,
    pub text: String,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSegment {
    pub segment: Segment,
    /// Cosine similarity to the query.
    pub score: f64,
}

/// Searchable index over documents.
pub trait RetrievalIndex: Send + Sync {
    /// Segments and embeds `document`.
    fn index(&self, document: &str) -> Result<IndexHandle, ContextError>;

    /// Returns up to `k` segments ranked by similarity to `query`.
    ///
    /// Ties are broken by document order.
    fn search(
        &self,
        handle: IndexHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredSegment>, ContextError>;

    /// All segments of an indexed document, in document order.
    fn segments(&self, handle: IndexHandle) -> Result<Vec<Segment>, ContextError>;

    /// Drops an indexed document. Later lookups on `handle` fail.
    fn release(&self, handle: IndexHandle) -> Result<(), ContextError>;
}

/// Deterministic text embedder using hashed features.
///
/// Half of the dimensions hold identifier sub-word counts, a quarter hold
/// character trigram counts, and the rest hold shape statistics. Vectors are
/// L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed(&self, text: &str) -> Array1<f64> {
        let mut embedding = Array1::zeros(self.dimension);
        if text.trim().is_empty() {
            return embedding;
        }

        let words = subwords(text);
        let word_dim = self.dimension / 2;
        for word in &words {
            embedding[hash_to_index(word, word_dim)] += 1.0;
        }

        let trigram_dim = self.dimension / 4;
        let lowered: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        for window in lowered.windows(3) {
            let trigram: String = window.iter().collect();
            embedding[word_dim + hash_to_index(&trigram, trigram_dim)] += 0.5;
        }

        let stats = word_dim + trigram_dim;
        let line_count = text.lines().count().max(1) as f64;
        embedding[stats] = (text.len() as f64 / 2000.0).min(1.0);
        embedding[stats + 1] = (text.matches('{').count() as f64 / line_count).min(1.0);

        normalize(&mut embedding);
        embedding
    }
}

/// Lowercase identifier pieces: `readBuffer_size` becomes `read`, `buffer`, `size`.
fn subwords(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut prev_lower = false;
        for c in raw.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
}

fn hash_to_index(input: &str, max_index: usize) -> usize {
    if max_index == 0 {
        return 0;
    }
    let hash = Sha256::digest(input.as_bytes());
    let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]) as usize;
    value % max_index
}

fn normalize(v: &mut Array1<f64>) {
    let norm = v.dot(v).sqrt();
    if norm > 1e-10 {
        v.mapv_inplace(|x| x / norm);
    }
}

/// Cosine similarity; zero when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();
    if norm_a < 1e-10 || norm_b < 1e-10 {
        return 0.0;
    }
    a.dot(b) / (norm_a * norm_b)
}

fn kind_patterns() -> Option<&'static [(SegmentKind, Regex); 3]> {
    static PATTERNS: OnceLock<Option<[(SegmentKind, Regex); 3]>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some([
                (
                    SegmentKind::Import,
                    Regex::new(r"^\s*(#\s*include|import\s|using\s|package\s)").ok()?,
                ),
                (
                    SegmentKind::Class,
                    Regex::new(r"^\s*(template\s*<.*>\s*)?((public|private|protected|abstract|final|static)\s+)*(class|struct|interface|enum)\s+\w+").ok()?,
                ),
                (
                    SegmentKind::Function,
                    Regex::new(r"^\s*[\w:<>,\*&\s]+\s+[\*&]?[\w:~]+\s*\([^;]*\)\s*(const)?\s*(throws [\w, ]+)?\s*\{?\s*$").ok()?,
                ),
            ])
        })
        .as_ref()
}

fn classify(text: &str) -> SegmentKind {
    let Some(first) = text.lines().map(str::trim).find(|line| {
        !line.is_empty() && !line.starts_with("//") && !line.starts_with('*') && !line.starts_with("/*")
    }) else {
        return SegmentKind::Other;
    };

    if let Some(patterns) = kind_patterns() {
        for (kind, re) in patterns {
            if re.is_match(first) {
                return *kind;
            }
        }
    }
    if first.ends_with('{') || first.starts_with('}') {
        SegmentKind::Block
    } else {
        SegmentKind::Other
    }
}

struct IndexedDocument {
    segments: Vec<Segment>,
    embeddings: Array2<f64>,
}

/// In-memory [`RetrievalIndex`] backed by [`HashEmbedder`].
pub struct HashEmbeddingIndex {
    embedder: HashEmbedder,
    segment_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
    next_handle: AtomicU64,
    documents: RwLock<HashMap<u64, IndexedDocument>>,
}

impl HashEmbeddingIndex {
    /// Creates an index with `dimension`-wide embeddings and segments of
    /// roughly `segment_tokens` tokens.
    pub fn new(dimension: usize, segment_tokens: usize) -> Self {
        Self {
            embedder: HashEmbedder::new(dimension),
            segment_tokens: segment_tokens.max(1),
            estimator: Arc::new(HeuristicTokenizer::default()),
            next_handle: AtomicU64::new(1),
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Number of documents currently held.
    pub fn document_count(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    /// Uses `estimator` to size segments.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Splits `document` into whole-line segments.
    ///
    /// A segment closes once it reaches the target size at a natural break
    /// (blank line or closing brace at column 0), or at twice the target
    /// size regardless.
    pub fn segment(&self, document: &str) -> Result<Vec<Segment>, ContextError> {
        let mut segments = Vec::new();
        let mut start = 0;
        let mut start_line = 1;
        let mut tokens = 0;
        let mut offset = 0;
        let mut line_no = 0;

        for line in document.split_inclusive('\n') {
            line_no += 1;
            offset += line.len();
            tokens += self.estimator.estimate(line)?;

            let natural_break = line.trim().is_empty() || line.starts_with('}');
            let full = tokens >= self.segment_tokens && natural_break;
            if full || tokens >= self.segment_tokens * 2 {
                segments.push(self.make_segment(
                    document,
                    segments.len(),
                    start,
                    offset,
                    start_line,
                    line_no,
                    tokens,
                ));
                start = offset;
                start_line = line_no + 1;
                tokens = 0;
            }
        }

        if start < document.len() {
            segments.push(self.make_segment(
                document,
                segments.len(),
                start,
                document.len(),
                start_line,
                line_no,
                tokens,
            ));
        }

        Ok(segments)
    }

    #[allow(clippy::too_many_arguments)]
    fn make_segment(
        &self,
        document: &str,
        id: usize,
        start: usize,
        end: usize,
        start_line: usize,
        end_line: usize,
        token_count: usize,
    ) -> Segment {
        let text = document[start..end].to_string();
        Segment {
            id,
            start,
            end,
            start_line,
            end_line,
            kind: classify(&text),
            token_count,
            text,
        }
    }
}

impl RetrievalIndex for HashEmbeddingIndex {
    fn index(&self, document: &str) -> Result<IndexHandle, ContextError> {
        let segments = self.segment(document)?;

        let mut embeddings = Array2::zeros((segments.len(), self.embedder.dimension()));
        for (i, segment) in segments.iter().enumerate() {
            embeddings.row_mut(i).assign(&self.embedder.embed(&segment.text));
        }

        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let mut documents = self
            .documents
            .write()
            .map_err(|_| ContextError::Indexing("index lock poisoned".to_string()))?;
        documents.insert(id, IndexedDocument { segments, embeddings });
        Ok(IndexHandle(id))
    }

    fn search(
        &self,
        handle: IndexHandle,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredSegment>, ContextError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ContextError::Indexing("index lock poisoned".to_string()))?;
        let document = documents
            .get(&handle.0)
            .ok_or(ContextError::UnknownHandle(handle.0))?;

        let query_embedding = self.embedder.embed(query);
        let mut scored: Vec<(usize, f64)> = document
            .embeddings
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| (i, cosine_similarity(&row.to_owned(), &query_embedding)))
            .collect();

        scored.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredSegment {
                segment: document.segments[i].clone(),
                score,
            })
            .collect())
    }

    fn segments(&self, handle: IndexHandle) -> Result<Vec<Segment>, ContextError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ContextError::Indexing("index lock poisoned".to_string()))?;
        documents
            .get(&handle.0)
            .map(|doc| doc.segments.clone())
            .ok_or(ContextError::UnknownHandle(handle.0))
    }

    fn release(&self, handle: IndexHandle) -> Result<(), ContextError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| ContextError::Indexing("index lock poisoned".to_string()))?;
        documents
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(ContextError::UnknownHandle(handle.0))
    }
}
