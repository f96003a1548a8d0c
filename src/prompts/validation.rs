//! Prompt for behavioral review of generated code.

use crate::llm::Prompt;
use crate::pipeline::StageId;

const VALIDATION_SYSTEM_PROMPT: &str = r#"You are a test engineer verifying a port of legacy code to {target}.

Design unit tests that compare the port against the legacy behavior, run them mentally against the port, and report the outcome as JSON:

{
  "tests": [{"name": "test_...", "passed": true, "message": "", "category": "logic"}],
  "root_cause": null,
  "suggested_fixes": []
}

- category is one of logic, runtime, critical, style.
- Use style only for cosmetic issues that do not change behavior.
- When any test fails, give the most likely root_cause and concrete suggested_fixes.
- Respond with the JSON object only."#;

pub fn build_validation_prompt(
    target: &str,
    file_name: &str,
    code: &str,
    flow_description: &str,
    source_view: &str,
) -> Prompt {
    let system = VALIDATION_SYSTEM_PROMPT.replace("{target}", target);
    let user = format!(
        "## PORT `{}`\n```{}\n{}\n```\n\n## EXPECTED BEHAVIOR\n{}\n\n## LEGACY SOURCE\n{}\n",
        file_name,
        target,
        code.trim_end(),
        flow_description.trim(),
        source_view.trim_end()
    );
    Prompt::new(StageId::Validator, system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_prompt_embeds_code() {
        let prompt = build_validation_prompt(
            "python",
            "counter.py",
            "def main() -> None:\n    pass\n",
            "Counts to ten.",
            "int main() {}",
        );
        assert_eq!(prompt.stage, StageId::Validator);
        assert!(prompt.user.contains("```python\ndef main() -> None:"));
        assert!(prompt.user.contains("Counts to ten."));
    }
}
