//! Token estimation for context sizing.
//!
//! The estimator is injectable: the context manager only needs token spans
//! that tile the input exactly, so any tokenizer that produces contiguous
//! byte ranges can replace [`HeuristicTokenizer`].

use crate::error::ContextError;

/// A token as a half-open byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

/// Splits text into tokens for size estimation and chunking.
///
/// Implementations must return spans that are contiguous, in order, and
/// cover the whole input: `spans[0].start == 0`, each span starts where the
/// previous one ended, and the last one ends at `text.len()`.
pub trait TokenEstimator: Send + Sync {
    /// Tokenizes `text`, or fails if the text cannot be measured.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenSpan>, ContextError>;

    /// Number of tokens in `text`.
    fn estimate(&self, text: &str) -> Result<usize, ContextError> {
        Ok(self.tokenize(text)?.len())
    }

    fn name(&self) -> &str;
}

/// Approximates a BPE tokenizer without a vocabulary.
///
/// Whitespace attaches to the token that follows it, identifier runs are
/// cut every `max_word_chars` characters, and every other character is its
/// own token. Text containing replacement characters (U+FFFD) or NUL bytes
/// is treated as undecodable.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    max_word_chars: usize,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self { max_word_chars: 4 }
    }
}

impl HeuristicTokenizer {
    pub fn new(max_word_chars: usize) -> Self {
        Self {
            max_word_chars: max_word_chars.max(1),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl TokenEstimator for HeuristicTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenSpan>, ContextError> {
        let mut spans = Vec::with_capacity(text.len() / 3 + 1);
        let mut chars = text.char_indices().peekable();
        let mut start = 0;

        loop {
            while matches!(chars.peek(), Some(&(_, c)) if c.is_whitespace()) {
                chars.next();
            }

            let Some((i, c)) = chars.next() else {
                break;
            };
            if c == '\u{FFFD}' || c == '\0' {
                return Err(ContextError::Estimation(format!(
                    "undecodable character U+{:04X} at byte {}",
                    c as u32, i
                )));
            }

            let mut end = i + c.len_utf8();
            if is_word_char(c) {
                let mut taken = 1;
                while taken < self.max_word_chars {
                    match chars.peek() {
                        Some(&(j, d)) if is_word_char(d) => {
                            end = j + d.len_utf8();
                            chars.next();
                            taken += 1;
                        }
                        _ => break,
                    }
                }
            }

            spans.push(TokenSpan { start, end });
            start = end;
        }

        // Trailing whitespace belongs to the last token.
        if start < text.len() {
            match spans.last_mut() {
                Some(last) => last.end = text.len(),
                None => spans.push(TokenSpan {
                    start: 0,
                    end: text.len(),
                }),
            }
        }

        Ok(spans)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Content-blind spans of `chars_per_token` characters each.
///
/// Used when the configured estimator rejects the input, so the text can
/// still be windowed.
pub fn fallback_spans(text: &str, chars_per_token: usize) -> Vec<TokenSpan> {
    let step = chars_per_token.max(1);
    let mut spans = Vec::with_capacity(text.len() / step + 1);
    let mut start = 0;
    let mut count = 0;

    for (i, c) in text.char_indices() {
        count += 1;
        if count == step {
            let end = i + c.len_utf8();
            spans.push(TokenSpan { start, end });
            start = end;
            count = 0;
        }
    }
    if start < text.len() {
        spans.push(TokenSpan {
            start,
            end: text.len(),
        });
    }
    spans
}

/// Checks that `spans` tile `text`: they start at 0, each begins where the
/// previous one ended, the last ends at `text.len()`, and every boundary
/// falls on a char boundary.
pub fn check_tiling(text: &str, spans: &[TokenSpan]) -> Result<(), ContextError> {
    let mut expected = 0;
    for (i, span) in spans.iter().enumerate() {
        if span.start != expected {
            return Err(ContextError::Estimation(format!(
                "span {} starts at byte {}, expected {}",
                i, span.start, expected
            )));
        }
        if span.end <= span.start || span.end > text.len() || !text.is_char_boundary(span.end) {
            return Err(ContextError::Estimation(format!(
                "span {} ends at invalid byte {}",
                i, span.end
            )));
        }
        expected = span.end;
    }
    if expected != text.len() {
        return Err(ContextError::Estimation(format!(
            "spans cover {} of {} bytes",
            expected,
            text.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(text: &str, spans: &[TokenSpan]) {
        if text.is_empty() {
            assert!(spans.is_empty());
            return;
        }
        assert_eq!(spans[0].start, 0);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn test_tokenize_code() {
        let text = "int main() {\n    return 0;\n}\n";
        let spans = HeuristicTokenizer::default().tokenize(text).unwrap();
        assert_tiles(text, &spans);

        let tokens: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
        assert_eq!(tokens[0], "int");
        assert_eq!(tokens[1], " main");
        assert_eq!(tokens[2], "(");
        assert_eq!(tokens.last().copied(), Some("\n}\n"));
    }

    #[test]
    fn test_long_identifiers_split() {
        let text = "allocate_buffer";
        let spans = HeuristicTokenizer::default().tokenize(text).unwrap();
        assert_eq!(spans.len(), 4);
        assert_tiles(text, &spans);
    }

    #[test]
    fn test_whitespace_only_and_empty() {
        let tokenizer = HeuristicTokenizer::default();
        assert_eq!(tokenizer.estimate("").unwrap(), 0);

        let spans = tokenizer.tokenize("   \n").unwrap();
        assert_eq!(spans, vec![TokenSpan { start: 0, end: 4 }]);
    }

    #[test]
    fn test_multibyte_text_tiles() {
        let text = "// café ünïcode → ok\n";
        let spans = HeuristicTokenizer::default().tokenize(text).unwrap();
        assert_tiles(text, &spans);
    }

    #[test]
    fn test_undecodable_input_fails() {
        let tokenizer = HeuristicTokenizer::default();
        assert!(matches!(
            tokenizer.estimate("int x = 1; \u{FFFD}"),
            Err(ContextError::Estimation(_))
        ));
        assert!(tokenizer.estimate("a\0b").is_err());
    }

    #[test]
    fn test_fallback_spans_tile() {
        let text = "abc\u{FFFD}defgh\0ij";
        let spans = fallback_spans(text, 4);
        assert_tiles(text, &spans);
        assert_eq!(spans.len(), 3);
    }

    #[test]
    fn test_check_tiling() {
        let text = "ab cé";
        let spans = HeuristicTokenizer::default().tokenize(text).unwrap();
        assert!(check_tiling(text, &spans).is_ok());
        assert!(check_tiling("", &[]).is_ok());

        let words = [TokenSpan { start: 0, end: 2 }, TokenSpan { start: 3, end: 6 }];
        assert!(check_tiling(text, &words).is_err());

        let short = [TokenSpan { start: 0, end: 3 }];
        assert!(check_tiling(text, &short).is_err());

        // 'é' spans bytes 4..6
        let split_char = [TokenSpan { start: 0, end: 5 }, TokenSpan { start: 5, end: 6 }];
        assert!(check_tiling(text, &split_char).is_err());

        let past_end = [TokenSpan { start: 0, end: 9 }];
        assert!(check_tiling(text, &past_end).is_err());
    }
}
