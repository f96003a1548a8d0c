//! Extraction of structured payloads from free-form backend responses.
//!
//! Backends answer in prose, markdown, or bare JSON. Stages need either a
//! JSON object (analysis, validation reports) or a block of source code
//! (generated artifacts). Both are pulled out here with a fixed strategy
//! order so a stage sees the same payload for the same response text.
//!
//! JSON strategies, in order:
//! 1. ```` ```json ```` fenced block
//! 2. any fenced block whose body holds an object
//! 3. the response itself, if it starts with `{`
//! 4. the largest balanced object anywhere (later wins on ties)
//!
//! If none parse and an object was opened but never closed, the result is
//! [`ExtractionResult::Truncated`].

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Why a payload could not be extracted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
    #[error("No code block found in response")]
    NoCode,
}

/// Outcome of a JSON extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    Success(String),
    Truncated {
        partial_json: String,
        unclosed_braces: usize,
    },
    NotFound,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionResult::Success(_))
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, ExtractionResult::Truncated { .. })
    }

    /// Converts into a `Result`, previewing `content` when nothing was found.
    pub fn into_result(self, content: &str) -> Result<String, ExtractionError> {
        match self {
            ExtractionResult::Success(json) => Ok(json),
            ExtractionResult::Truncated {
                partial_json,
                unclosed_braces,
            } => Err(ExtractionError::Truncated {
                partial_preview: preview(&partial_json, 100),
                unclosed_braces,
            }),
            ExtractionResult::NotFound => Err(ExtractionError::NotFound {
                content_preview: preview(content.trim(), 50),
            }),
        }
    }
}

fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn fenced_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```([A-Za-z0-9_+\-]*)[ \t]*\r?\n([\s\S]*?)```").ok())
        .as_ref()
}

/// A fenced markdown block: its info-string tag and its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock<'a> {
    pub tag: &'a str,
    pub body: &'a str,
}

/// Returns every fenced block in `content`, in order of appearance.
pub fn fenced_blocks(content: &str) -> Vec<FencedBlock<'_>> {
    let Some(re) = fenced_block_regex() else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|caps| {
            Some(FencedBlock {
                tag: caps.get(1).map(|m| m.as_str()).unwrap_or(""),
                body: caps.get(2)?.as_str(),
            })
        })
        .collect()
}

/// Finds the index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escapes are honored, so braces inside strings do not
/// count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Counts braces left open at the end of `s`, ignoring string contents.
pub fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth.max(0) as usize
}

fn parses_as_object(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(candidate),
        Ok(serde_json::Value::Object(_))
    )
}

fn balanced_object_at(s: &str, start: usize) -> Option<&str> {
    let end = find_matching_brace(&s[start..])?;
    let candidate = &s[start..=start + end];
    parses_as_object(candidate).then_some(candidate)
}

fn largest_object(content: &str) -> Option<&str> {
    content
        .char_indices()
        .filter(|&(_, c)| c == '{')
        .filter_map(|(i, _)| balanced_object_at(content, i).map(|json| (i, json)))
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json)
}

/// Attempts to pull a JSON object out of a backend response.
pub fn try_extract_json(content: &str) -> ExtractionResult {
    let trimmed = content.trim();

    let blocks = fenced_blocks(trimmed);
    let tagged = blocks.iter().filter(|b| b.tag.eq_ignore_ascii_case("json"));
    let untagged = blocks.iter().filter(|b| !b.tag.eq_ignore_ascii_case("json"));
    for block in tagged.chain(untagged) {
        let body = block.body.trim();
        if let Some(start) = body.find('{') {
            if let Some(json) = balanced_object_at(body, start) {
                return ExtractionResult::Success(json.to_string());
            }
        }
    }

    if trimmed.starts_with('{') {
        if let Some(json) = balanced_object_at(trimmed, 0) {
            return ExtractionResult::Success(json.to_string());
        }
    }

    if let Some(json) = largest_object(trimmed) {
        return ExtractionResult::Success(json.to_string());
    }

    if let Some(start) = trimmed.find('{') {
        let open = unclosed_braces(&trimmed[start..]);
        if open > 0 {
            return ExtractionResult::Truncated {
                partial_json: trimmed[start..].to_string(),
                unclosed_braces: open,
            };
        }
    }

    ExtractionResult::NotFound
}

/// Extracts and deserializes a JSON object from a backend response.
pub fn extract_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, ExtractionError> {
    let json = try_extract_json(content).into_result(content)?;
    serde_json::from_str(&json).map_err(|_| ExtractionError::NotFound {
        content_preview: preview(&json, 50),
    })
}

/// Extracts a block of source code from a backend response.
///
/// A fenced block tagged with `language` wins; otherwise the first fenced
/// block that is not JSON; otherwise the whole response if it contains no
/// fence at all. An unterminated fence is treated as missing code.
pub fn extract_code_block(content: &str, language: &str) -> Result<String, ExtractionError> {
    let blocks = fenced_blocks(content);

    if let Some(block) = blocks
        .iter()
        .find(|b| b.tag.eq_ignore_ascii_case(language))
        .or_else(|| blocks.iter().find(|b| !b.tag.eq_ignore_ascii_case("json")))
    {
        let body = block.body.trim_end();
        if body.trim().is_empty() {
            return Err(ExtractionError::NoCode);
        }
        return Ok(format!("{}\n", body));
    }

    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed.contains("```") {
        return Err(ExtractionError::NoCode);
    }
    Ok(format!("{}\n", trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_object() {
        let input = r#"{"classes": [], "functions": ["main"]}"#;
        assert_eq!(try_extract_json(input), ExtractionResult::Success(input.to_string()));
    }

    #[test]
    fn test_json_fence_preferred_over_prose_object() {
        let input = "Thinking about {\"draft\": 1} first.\n```json\n{\"final\": true}\n```\n";
        assert_eq!(
            try_extract_json(input),
            ExtractionResult::Success(r#"{"final": true}"#.to_string())
        );
    }

    #[test]
    fn test_largest_object_wins_in_prose() {
        let input = r#"Example {"a": 1}. Answer: {"a": 1, "b": {"c": 2}} done"#;
        assert_eq!(
            try_extract_json(input),
            ExtractionResult::Success(r#"{"a": 1, "b": {"c": 2}}"#.to_string())
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let input = r#"{"pattern": "{ not a brace }"}"#;
        assert_eq!(find_matching_brace(input), Some(input.len() - 1));
    }

    #[test]
    fn test_truncated_detection() {
        let result = try_extract_json(r#"{"classes": [{"name": "Foo""#);
        assert!(result.is_truncated());
        let err = result.into_result("").unwrap_err();
        assert!(matches!(err, ExtractionError::Truncated { unclosed_braces: 2, .. }));
    }

    #[test]
    fn test_not_found_preview() {
        let err = try_extract_json("no json here")
            .into_result("no json here")
            .unwrap_err();
        assert_eq!(
            err,
            ExtractionError::NotFound {
                content_preview: "no json here".to_string()
            }
        );
    }

    #[test]
    fn test_extract_json_typed() {
        #[derive(serde::Deserialize)]
        struct Report {
            pass_rate: f64,
        }
        let report: Report = extract_json("```json\n{\"pass_rate\": 0.5}\n```").unwrap();
        assert!((report.pass_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_extract_code_block_prefers_language_tag() {
        let input = "```json\n{}\n```\n```python\ndef main():\n    pass\n```";
        assert_eq!(
            extract_code_block(input, "python").unwrap(),
            "def main():\n    pass\n"
        );
    }

    #[test]
    fn test_extract_code_block_untagged_and_bare() {
        let fenced = "Here you go:\n```\nx = 1\n```";
        assert_eq!(extract_code_block(fenced, "python").unwrap(), "x = 1\n");
        assert_eq!(extract_code_block("x = 1", "python").unwrap(), "x = 1\n");
    }

    #[test]
    fn test_extract_code_block_rejects_unterminated_fence() {
        assert_eq!(
            extract_code_block("```python\ndef main(", "python"),
            Err(ExtractionError::NoCode)
        );
        assert_eq!(extract_code_block("   ", "python"), Err(ExtractionError::NoCode));
    }
}
