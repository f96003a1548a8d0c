//! Validator stage: static checks plus backend-reported behavioral tests.
//!
//! A failing result is a normal output, not an error. The orchestrator
//! commits it and the router decides whether to retry.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::context::{PreparedContext, StageObjective};
use crate::llm::{GenerationConfig, InferenceBackend};
use crate::pipeline::stage::{require, Stage, StageId, StageOutput, StageReport};
use crate::pipeline::state::{
    FailureKind, GeneratedArtifact, LogicSchema, PipelineState, ValidationFailure,
    ValidationResult,
};
use crate::prompts::build_validation_prompt;
use crate::utils::extract_json;

use super::error::{StageError, StageResult};
use super::mapper::pascal_case;

#[derive(Debug, Deserialize)]
struct TestOutcome {
    name: String,
    passed: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackendVerdict {
    #[serde(default)]
    tests: Vec<TestOutcome>,
    #[serde(default)]
    root_cause: Option<String>,
    #[serde(default)]
    suggested_fixes: Vec<String>,
}

fn manual_memory_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:malloc|calloc|realloc|free)\s*\(|\bdelete\s+[A-Za-z_]").ok())
        .as_ref()
}

/// Produces a `validation_result` per artifact.
pub struct ValidatorAgent {
    backend: Arc<dyn InferenceBackend>,
    generation: GenerationConfig,
}

impl ValidatorAgent {
    pub fn new(backend: Arc<dyn InferenceBackend>, generation: GenerationConfig) -> Self {
        Self {
            backend,
            generation,
        }
    }
}

/// True if this job already validated identical code with the opposite verdict.
fn contradicts_history(state: &PipelineState, result: &ValidationResult) -> bool {
    state
        .validation_history()
        .iter()
        .rev()
        .find(|earlier| earlier.artifact_hash == result.artifact_hash)
        .is_some_and(|earlier| earlier.passed != result.passed)
}

#[async_trait]
impl Stage for ValidatorAgent {
    fn id(&self) -> StageId {
        StageId::Validator
    }

    async fn run(&self, state: &PipelineState, context: &PreparedContext) -> StageResult<StageReport> {
        let schema = require(StageId::Validator, state.logic_schema(), "logic_schema")?;
        let artifact = require(StageId::Validator, state.generated_artifact(), "generated_artifact")?;

        let (static_checks, mut failures) = static_checks(artifact, schema);

        let focus: Vec<String> = schema.classes.iter().map(|c| c.name.clone()).collect();
        let view = context
            .view(StageObjective::Validation, &focus)
            .map_err(|e| StageError::context(StageId::Validator, e))?;
        let prompt = build_validation_prompt(
            &artifact.language,
            &artifact.file_name,
            &artifact.code,
            &schema.flow_description,
            &view.render(),
        );
        let reply = self
            .backend
            .complete(&prompt, &self.generation)
            .await
            .map_err(|e| StageError::backend(StageId::Validator, e))?;
        let verdict: BackendVerdict = extract_json(&reply)
            .map_err(|e| StageError::malformed(StageId::Validator, e.to_string()))?;
        if verdict.tests.is_empty() {
            return Err(StageError::malformed(StageId::Validator, "no tests reported"));
        }

        let tests_run = verdict.tests.len();
        failures.extend(verdict.tests.into_iter().filter(|t| !t.passed).map(|t| {
            ValidationFailure::new(
                t.name,
                FailureKind::parse_lenient(t.category.as_deref()),
                if t.message.trim().is_empty() {
                    "failed".to_string()
                } else {
                    t.message
                },
            )
        }));

        let result = ValidationResult::from_checks(artifact, static_checks + tests_run, failures)
            .with_diagnosis(verdict.root_cause, verdict.suggested_fixes);

        let mut warnings = Vec::new();
        if contradicts_history(state, &result) {
            warn!(
                attempt = artifact.attempt,
                hash = %artifact.content_hash,
                "Backend verdict changed for identical code"
            );
            warnings.push(format!(
                "non-deterministic verdict for identical code (attempt {})",
                artifact.attempt
            ));
        }

        let blocking = result.blocking_failures().count();
        debug!(
            attempt = artifact.attempt,
            passed = result.passed,
            checks = result.checks_run,
            blocking,
            "Validation finished"
        );

        let message = if result.passed {
            format!(
                "attempt {} passed ({} checks, pass rate {:.0}%)",
                result.attempt,
                result.checks_run,
                result.pass_rate * 100.0
            )
        } else {
            format!(
                "attempt {} failed: {} blocking of {} checks",
                result.attempt, blocking, result.checks_run
            )
        };
        Ok(StageReport::new(StageOutput::Validation(result), message).with_warnings(warnings))
    }
}

/// Runs the checks that need no backend. Returns how many ran and the failures.
fn static_checks(artifact: &GeneratedArtifact, schema: &LogicSchema) -> (usize, Vec<ValidationFailure>) {
    let code = &artifact.code;
    let mut failures = Vec::new();
    let mut run = 0;

    let mut check = |name: &str, ok: bool, kind: FailureKind, message: String| {
        run += 1;
        if !ok {
            failures.push(ValidationFailure::new(name, kind, message));
        }
    };

    let substantive = code
        .lines()
        .map(str::trim)
        .any(|l| !l.is_empty() && !l.starts_with('#'));
    check(
        "non_empty",
        substantive,
        FailureKind::Critical,
        "module has no executable lines".to_string(),
    );

    check(
        "entry_point",
        code.contains("def main(") || code.contains("__main__"),
        FailureKind::Logic,
        "no main() entry point".to_string(),
    );

    check(
        "balanced_delimiters",
        delimiters_balanced(code),
        FailureKind::Runtime,
        "unbalanced brackets; the module will not parse".to_string(),
    );

    let manual = manual_memory_re()
        .and_then(|re| re.find(code))
        .map(|m| m.as_str().trim().to_string());
    check(
        "no_manual_memory",
        manual.is_none(),
        FailureKind::Logic,
        format!("manual memory management survives: `{}`", manual.unwrap_or_default()),
    );

    let missing: Vec<String> = schema
        .classes
        .iter()
        .map(|c| pascal_case(&c.name))
        .filter(|name| !code.contains(&format!("class {}", name)))
        .collect();
    check(
        "definitions_present",
        missing.is_empty(),
        FailureKind::Logic,
        format!("missing classes: {}", missing.join(", ")),
    );

    let unannotated = code
        .lines()
        .map(str::trim_start)
        .filter(|l| l.starts_with("def ") && !l.contains("->"))
        .count();
    check(
        "type_annotations",
        unannotated == 0,
        FailureKind::Style,
        format!("{} functions without return annotations", unannotated),
    );

    check(
        "docstrings",
        code.contains("\"\"\""),
        FailureKind::Style,
        "no docstrings".to_string(),
    );

    (run, failures)
}

/// Bracket balance outside string literals.
fn delimiters_balanced(code: &str) -> bool {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for line in code.lines() {
        for c in line.chars() {
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '#' => break,
                '"' | '\'' => quote = Some(c),
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(open) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        // Quotes do not span lines; triple-quoted blocks pair up within a line or are skipped.
        quote = None;
        escaped = false;
    }
    stack.is_empty()
}
