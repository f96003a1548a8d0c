//! Generator stage: target-language code from the schema and plan.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::{PreparedContext, StageObjective};
use crate::llm::{GenerationConfig, InferenceBackend};
use crate::pipeline::stage::{require, Stage, StageId, StageOutput, StageReport};
use crate::pipeline::state::{
    DesignMapping, GeneratedArtifact, LogicSchema, PipelineState, ValidationResult,
};
use crate::prompts::{build_generation_prompt, GenerationInputs};
use crate::utils::extract_code_block;

use super::error::{StageError, StageResult};
use super::mapper::{pascal_case, snake_case};

/// Produces a `generated_artifact` per attempt.
pub struct GeneratorAgent {
    backend: Arc<dyn InferenceBackend>,
    generation: GenerationConfig,
    target_language: String,
}

impl GeneratorAgent {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        generation: GenerationConfig,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            generation,
            target_language: target_language.into(),
        }
    }
}

#[async_trait]
impl Stage for GeneratorAgent {
    fn id(&self) -> StageId {
        StageId::Generator
    }

    async fn run(&self, state: &PipelineState, context: &PreparedContext) -> StageResult<StageReport> {
        let schema = require(StageId::Generator, state.logic_schema(), "logic_schema")?;
        let mapping = require(StageId::Generator, state.design_mapping(), "design_mapping")?;
        let attempt = state.next_attempt();

        // Feedback only from a failed validation of the previous artifact.
        let previous = state.validation_result().filter(|v| !v.passed);
        let failures = previous.map(feedback).unwrap_or_default();
        let root_cause = previous.and_then(|v| v.root_cause.as_deref());
        if !failures.is_empty() {
            info!(
                attempt,
                failures = failures.len(),
                "Regenerating with validation feedback"
            );
        }

        let focus: Vec<String> = mapping.symbol_map.keys().cloned().collect();
        let view = context
            .view(StageObjective::Generation, &focus)
            .map_err(|e| StageError::context(StageId::Generator, e))?;

        let file_name = target_file_name(state.source().stem(), &self.target_language);
        let outline = outline(schema, mapping);
        let plan = plan(mapping);
        let prompt = build_generation_prompt(&GenerationInputs {
            target: &self.target_language,
            file_name: &file_name,
            outline: &outline,
            plan: &plan,
            flow_description: &schema.flow_description,
            source_view: &view.render(),
            attempt,
            failures: &failures,
            root_cause,
        });

        let reply = self
            .backend
            .complete(&prompt, &self.generation)
            .await
            .map_err(|e| StageError::backend(StageId::Generator, e))?;
        let code = extract_code_block(&reply, &self.target_language)
            .map_err(|e| StageError::malformed(StageId::Generator, e.to_string()))?;

        let artifact = GeneratedArtifact::new(
            code,
            self.target_language.clone(),
            file_name,
            attempt,
            failures,
        );
        debug!(
            attempt,
            lines = artifact.line_count(),
            hash = %artifact.content_hash,
            "Generated artifact"
        );

        let message = format!(
            "{} ({} lines, attempt {})",
            artifact.file_name,
            artifact.line_count(),
            attempt
        );
        Ok(StageReport::new(StageOutput::Artifact(artifact), message))
    }
}

/// Blocking failures plus suggested fixes, one line each.
fn feedback(result: &ValidationResult) -> Vec<String> {
    result
        .blocking_failures()
        .map(|f| f.to_string())
        .chain(result.suggested_fixes.iter().map(|fix| format!("suggested fix: {}", fix)))
        .collect()
}

/// `- class X` / `- def y` lines for every definition the module must carry.
fn outline(schema: &LogicSchema, mapping: &DesignMapping) -> String {
    let mut lines = Vec::new();
    for class in &schema.classes {
        let name = mapping
            .symbol_map
            .get(&class.name)
            .cloned()
            .unwrap_or_else(|| pascal_case(&class.name));
        lines.push(format!("- class {}", name));
        for method in &class.methods {
            lines.push(format!("    - method {}", snake_case(method)));
        }
    }
    for function in schema.functions.iter().filter(|f| f.owner.is_none()) {
        let name = mapping
            .symbol_map
            .get(&function.name)
            .cloned()
            .unwrap_or_else(|| snake_case(&function.name));
        let line = format!("- def {}", name);
        if !lines.contains(&line) {
            lines.push(line);
        }
    }
    if !lines.iter().any(|l| l == "- def main") {
        lines.push("- def main".to_string());
    }
    lines.join("\n")
}

fn plan(mapping: &DesignMapping) -> String {
    if mapping.patterns.is_empty() {
        return "(no legacy idioms to replace)".to_string();
    }
    mapping
        .patterns
        .iter()
        .map(|p| format!("{} -> {}: {}", p.legacy, p.target, p.symbols.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn target_file_name(stem: &str, target_language: &str) -> String {
    let extension = match target_language.to_ascii_lowercase().as_str() {
        "python" => "py",
        "rust" => "rs",
        "typescript" => "ts",
        "go" => "go",
        other => return format!("{}.{}", snake_case(stem), other),
    };
    format!("{}.{}", snake_case(stem), extension)
}
