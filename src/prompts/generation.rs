//! Prompt for target-language code generation.

use crate::llm::Prompt;
use crate::pipeline::StageId;

const GENERATION_SYSTEM_PROMPT: &str = r#"You are an expert {target} engineer porting legacy code.

Write one complete, idiomatic {target} module that reproduces the behavior of the legacy code.

Requirements:
- Follow the translation plan exactly; every listed pattern must be applied.
- Add type annotations to every function signature.
- Give every class and function a docstring.
- Bind resource lifetimes to scopes (context managers), never to manual release calls.
- Provide a `main()` entry point guarded by `if __name__ == "__main__":`.

Respond with the module in a single ```{target} fenced block and nothing else."#;

/// Inputs for one generation attempt.
#[derive(Debug, Clone, Default)]
pub struct GenerationInputs<'a> {
    pub target: &'a str,
    pub file_name: &'a str,
    /// `- class X` / `- def y` lines naming what the module must define.
    pub outline: &'a str,
    /// `legacy -> target` lines from the translation plan.
    pub plan: &'a str,
    pub flow_description: &'a str,
    /// The source as the context manager presents it for generation.
    pub source_view: &'a str,
    pub attempt: u32,
    /// Failures from the previous validation, empty on the first attempt.
    pub failures: &'a [String],
    pub root_cause: Option<&'a str>,
}

pub fn build_generation_prompt(inputs: &GenerationInputs<'_>) -> Prompt {
    let system = GENERATION_SYSTEM_PROMPT.replace("{target}", inputs.target);

    let mut user = format!(
        "## MODULE `{}` (attempt {})\n\n## REQUIRED DEFINITIONS\n{}\n\n## TRANSLATION PLAN\n{}\n\n## BEHAVIOR\n{}\n\n## LEGACY SOURCE\n{}\n",
        inputs.file_name,
        inputs.attempt,
        inputs.outline.trim_end(),
        inputs.plan.trim_end(),
        inputs.flow_description.trim(),
        inputs.source_view.trim_end()
    );

    if !inputs.failures.is_empty() {
        user.push_str("\n## PREVIOUS ATTEMPT FAILED VALIDATION\nFix every item below:\n");
        for failure in inputs.failures {
            user.push_str(&format!("* {}\n", failure));
        }
        if let Some(cause) = inputs.root_cause {
            user.push_str(&format!("\nLikely root cause: {}\n", cause));
        }
    }

    Prompt::new(StageId::Generator, system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_failure_section() {
        let prompt = build_generation_prompt(&GenerationInputs {
            target: "python",
            file_name: "counter.py",
            outline: "- class Counter\n- def main",
            plan: "manual_allocation -> scoped_acquisition",
            attempt: 1,
            ..Default::default()
        });
        assert!(prompt.system.contains("idiomatic python module"));
        assert!(prompt.user.contains("- class Counter"));
        assert!(!prompt.user.contains("FAILED VALIDATION"));
    }

    #[test]
    fn test_retry_lists_failures() {
        let failures = vec!["[logic] test_cleanup: handle still open".to_string()];
        let prompt = build_generation_prompt(&GenerationInputs {
            target: "python",
            file_name: "counter.py",
            attempt: 2,
            failures: &failures,
            root_cause: Some("missing with block"),
            ..Default::default()
        });
        assert!(prompt.user.contains("(attempt 2)"));
        assert!(prompt.user.contains("* [logic] test_cleanup"));
        assert!(prompt.user.contains("Likely root cause: missing with block"));
    }
}
