//! Prompt for the migration narrative.

use crate::llm::Prompt;
use crate::pipeline::StageId;

const DOCUMENTATION_SYSTEM_PROMPT: &str = "You are a technical writer. Explain a completed code migration to the engineers who will maintain the new module. Write two short paragraphs of plain prose: what the code does, then what changed in the port and why it matters. No headings, no lists, no code.";

/// `patterns` are `legacy -> target` lines.
pub fn build_documentation_prompt(
    file_name: &str,
    target: &str,
    flow_description: &str,
    patterns: &[String],
    attempts: u32,
) -> Prompt {
    let mut user = format!(
        "Legacy file: {}\nTarget language: {}\nAttempts needed: {}\n\nBehavior:\n{}\n\nApplied patterns:\n",
        file_name,
        target,
        attempts,
        flow_description.trim()
    );
    for pattern in patterns {
        user.push_str(&format!("- {}\n", pattern));
    }
    Prompt::new(StageId::Documenter, DOCUMENTATION_SYSTEM_PROMPT, user)
}
