//! Sliding-window chunking with token overlap.
//!
//! Chunk `i` covers tokens `[i * stride, i * stride + size)` where
//! `stride = size - overlap`; the last chunk ends at the final token. Every
//! chunk boundary falls on a token boundary, and the part of a chunk that
//! repeats its predecessor (the overlap) is tracked so the unique spans
//! concatenate back to the original text.

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

use super::tokens::TokenSpan;

/// One window over the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the chunk sequence.
    pub index: usize,
    /// Byte offset where the chunk starts.
    pub start: usize,
    /// Byte offset where the chunk ends (exclusive).
    pub end: usize,
    /// Byte offset where content not shared with the previous chunk begins.
    pub unique_start: usize,
    /// First token index (inclusive).
    pub token_start: usize,
    /// Last token index (exclusive).
    pub token_end: usize,
    /// Tokens shared with the previous chunk.
    pub overlap_tokens: usize,
    /// 1-based line of `start`.
    pub start_line: usize,
    /// 1-based line of the last byte.
    pub end_line: usize,
    pub text: String,
}

impl Chunk {
    pub fn token_count(&self) -> usize {
        self.token_end - self.token_start
    }

    /// The part of the chunk not repeated from its predecessor.
    pub fn unique_text(&self) -> &str {
        &self.text[self.unique_start - self.start..]
    }

    /// The leading part repeated from the predecessor.
    pub fn overlap_text(&self) -> &str {
        &self.text[..self.unique_start - self.start]
    }
}

/// Byte offsets of line starts, for offset-to-line lookups.
pub(crate) struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            newlines: text
                .bytes()
                .enumerate()
                .filter(|&(_, b)| b == b'\n')
                .map(|(i, _)| i)
                .collect(),
        }
    }

    /// 1-based line containing byte `offset`.
    pub(crate) fn line_of(&self, offset: usize) -> usize {
        self.newlines.partition_point(|&nl| nl < offset) + 1
    }
}

/// Splits `text` into overlapping chunks along `spans`.
///
/// `spans` must tile `text` (see [`super::tokens::TokenEstimator`]).
///
/// # Errors
///
/// Returns `ContextError::InvalidChunking` unless `0 <= overlap < size`.
pub fn chunk_text(
    text: &str,
    spans: &[TokenSpan],
    size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ContextError> {
    if size == 0 || overlap >= size {
        return Err(ContextError::InvalidChunking { size, overlap });
    }

    let stride = size - overlap;
    let lines = LineIndex::new(text);
    let mut chunks = Vec::with_capacity(spans.len() / stride + 1);
    let mut token_start = 0;
    let mut previous_end = 0;

    while token_start < spans.len() {
        let token_end = (token_start + size).min(spans.len());
        let start = spans[token_start].start;
        let end = spans[token_end - 1].end;
        let overlap_tokens = if chunks.is_empty() { 0 } else { overlap };
        let unique_start = if chunks.is_empty() { start } else { previous_end };

        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
            unique_start,
            token_start,
            token_end,
            overlap_tokens,
            start_line: lines.line_of(start),
            end_line: lines.line_of(end.saturating_sub(1).max(start)),
            text: text[start..end].to_string(),
        });

        if token_end == spans.len() {
            break;
        }
        previous_end = end;
        token_start += stride;
    }

    Ok(chunks)
}

/// Concatenates the unique spans of `chunks` in order.
pub fn reassemble(chunks: &[Chunk]) -> String {
    chunks.iter().map(Chunk::unique_text).collect()
}
