//! Hierarchical extractive summaries of segments left out of retrieval.
//!
//! Segments are grouped in document order, `group_size` at a time, and each
//! group is reduced to its salient lines (declarations, signatures, imports,
//! ownership operations) within a token budget. Groups are merged level by
//! level until at most `group_size` roots remain. Every input segment is
//! covered by exactly one root.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ContextError;

use super::retrieval::Segment;
use super::tokens::TokenEstimator;

/// One summary node and the segments it stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryNode {
    /// 1 for groups of segments, higher for groups of groups.
    pub level: usize,
    /// Covered segment ids, ascending.
    pub segment_ids: Vec<usize>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// Builds summary trees over non-retrieved segments.
#[derive(Clone)]
pub struct HierarchicalSummarizer {
    group_size: usize,
    max_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
    salient: Option<Regex>,
}

impl std::fmt::Debug for HierarchicalSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalSummarizer")
            .field("group_size", &self.group_size)
            .field("max_tokens", &self.max_tokens)
            .field("estimator", &self.estimator.name())
            .finish()
    }
}

const SALIENT_PATTERN: &str = r"(?x)
    ^\s*(\#\s*include|import\s|package\s|using\s)
  | \b(class|struct|interface|enum|namespace|template)\b
  | \b(new|delete|malloc|calloc|realloc|free|fopen|fclose|lock|unlock)\b
  | ^\s*[\w:<>,\*&\s]+\s+[\*&]?[\w:~]+\s*\([^;]*\)\s*(const)?\s*\{?\s*$
  | \b(TODO|FIXME|HACK)\b
";

impl HierarchicalSummarizer {
    /// Groups of `group_size` (minimum 2); each node capped at `max_tokens`.
    pub fn new(group_size: usize, max_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            group_size: group_size.max(2),
            max_tokens: max_tokens.max(1),
            estimator,
            salient: Regex::new(SALIENT_PATTERN).ok(),
        }
    }

    /// Summarizes `segments` (in document order) into root nodes.
    pub fn summarize(&self, segments: &[&Segment]) -> Result<Vec<SummaryNode>, ContextError> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let mut level: Vec<SummaryNode> = segments
            .chunks(self.group_size)
            .map(|group| self.leaf_node(group))
            .collect::<Result<_, _>>()?;

        while level.len() > self.group_size {
            level = level
                .chunks(self.group_size)
                .map(|group| self.merge_nodes(group))
                .collect::<Result<_, _>>()?;
        }

        Ok(level)
    }

    fn leaf_node(&self, group: &[&Segment]) -> Result<SummaryNode, ContextError> {
        let mut lines = Vec::new();
        for segment in group {
            lines.push(format!(
                "[lines {}-{}, {:?}]",
                segment.start_line, segment.end_line, segment.kind
            ));
            lines.extend(self.salient_lines(&segment.text));
        }

        Ok(SummaryNode {
            level: 1,
            segment_ids: group.iter().map(|s| s.id).collect(),
            start_line: group.first().map(|s| s.start_line).unwrap_or(0),
            end_line: group.last().map(|s| s.end_line).unwrap_or(0),
            text: self.fit_budget(&lines)?,
        })
    }

    fn merge_nodes(&self, group: &[SummaryNode]) -> Result<SummaryNode, ContextError> {
        let lines: Vec<String> = group
            .iter()
            .flat_map(|node| node.text.lines().map(str::to_string))
            .collect();

        Ok(SummaryNode {
            level: group.iter().map(|n| n.level).max().unwrap_or(0) + 1,
            segment_ids: group.iter().flat_map(|n| n.segment_ids.iter().copied()).collect(),
            start_line: group.first().map(|n| n.start_line).unwrap_or(0),
            end_line: group.last().map(|n| n.end_line).unwrap_or(0),
            text: self.fit_budget(&lines)?,
        })
    }

    /// Salient lines of `text`, or its first non-blank line if none match.
    fn salient_lines(&self, text: &str) -> Vec<String> {
        let picked: Vec<String> = match &self.salient {
            Some(re) => text
                .lines()
                .filter(|line| re.is_match(line))
                .map(|line| format!("  {}", line.trim()))
                .collect(),
            None => Vec::new(),
        };

        if picked.is_empty() {
            text.lines()
                .find(|line| !line.trim().is_empty())
                .map(|line| vec![format!("  {}", line.trim())])
                .unwrap_or_default()
        } else {
            picked
        }
    }

    /// Keeps lines in order until the token budget is spent.
    fn fit_budget(&self, lines: &[String]) -> Result<String, ContextError> {
        let mut kept = Vec::new();
        let mut used = 0;

        for (i, line) in lines.iter().enumerate() {
            let cost = self.estimator.estimate(line)? + 1;
            if used + cost > self.max_tokens && !kept.is_empty() {
                kept.push(format!("  ... ({} more lines)", lines.len() - i));
                break;
            }
            used += cost;
            kept.push(line.clone());
        }

        Ok(kept.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::retrieval::SegmentKind;
    use crate::context::tokens::HeuristicTokenizer;

    fn segment(id: usize, text: &str) -> Segment {
        Segment {
            id,
            start: id * 100,
            end: id * 100 + text.len(),
            start_line: id * 10 + 1,
            end_line: id * 10 + 9,
            kind: SegmentKind::Function,
            token_count: 10,
            text: text.to_string(),
        }
    }

    fn summarizer(group_size: usize, max_tokens: usize) -> HierarchicalSummarizer {
        HierarchicalSummarizer::new(group_size, max_tokens, Arc::new(HeuristicTokenizer::default()))
    }

    #[test]
    fn test_every_segment_covered_once() {
        let segments: Vec<Segment> = (0..23)
            .map(|i| segment(i, &format!("int helper_{i}(int x) {{\n    return x + {i};\n}}\n")))
            .collect();
        let refs: Vec<&Segment> = segments.iter().collect();

        let roots = summarizer(4, 256).summarize(&refs).unwrap();
        assert!(roots.len() <= 4);
        assert!(roots.iter().all(|r| r.level >= 2));

        let mut covered: Vec<usize> = roots.iter().flat_map(|r| r.segment_ids.clone()).collect();
        covered.sort_unstable();
        assert_eq!(covered, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn test_salient_lines_extracted() {
        let seg = segment(
            0,
            "class Pool {\n    int count = 0;\n    char* buf = (char*)malloc(64);\n    int x = 1;\n};\n",
        );
        let roots = summarizer(4, 256).summarize(&[&seg]).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].level, 1);
        assert!(roots[0].text.contains("class Pool {"));
        assert!(roots[0].text.contains("malloc(64)"));
        assert!(!roots[0].text.contains("int x = 1;"));
    }

    #[test]
    fn test_budget_truncates() {
        let body: String = (0..50).map(|i| format!("void f{i}(int a) {{\n")).collect();
        let seg = segment(0, &body);
        let roots = summarizer(2, 40).summarize(&[&seg]).unwrap();
        assert!(roots[0].text.contains("more lines"));
        assert!(roots[0].text.lines().count() < 50);
    }

    #[test]
    fn test_empty_input() {
        assert!(summarizer(4, 256).summarize(&[]).unwrap().is_empty());
    }
}
