//! Documenter stage: migration report for a validated artifact.

use std::sync::Arc;

use async_trait::async_trait;
use tera::{Context, Tera};

use crate::context::PreparedContext;
use crate::llm::{GenerationConfig, InferenceBackend};
use crate::pipeline::stage::{require, Stage, StageId, StageOutput, StageReport};
use crate::pipeline::state::{Documentation, LogicSchema, PipelineState};
use crate::prompts::build_documentation_prompt;

use super::error::{StageError, StageResult};
use super::mapper::{pascal_case, snake_case};

const REPORT_TEMPLATE: &str = r#"# Migration of `{{ source_file }}`

{{ narrative }}

## Summary

| | |
|---|---|
| Source | `{{ source_file }}` ({{ source_language }}, {{ source_lines }} lines) |
| Target | `{{ artifact_file }}` ({{ target_language }}, {{ generated_lines }} lines) |
| Context strategy | {{ strategy }} |
| Attempts | {{ attempts }} |
| Final pass rate | {{ pass_rate }} |
| Cyclomatic complexity | {{ complexity }} |

## Behavior

{{ flow_description }}

## Applied patterns
{% if patterns %}
| Legacy | Target | Symbols |
|---|---|---|
{% for p in patterns %}| {{ p.legacy }} | {{ p.target }} | {{ p.symbols | join(sep=", ") }} |
{% endfor %}{% else %}
No legacy idioms required replacement.
{% endif %}
## Validation history
{% for v in history %}
- attempt {{ v.attempt }}: {% if v.passed %}passed{% else %}failed{% endif %} ({{ v.checks_run }} checks{% if v.failures %}, {{ v.failures | length }} findings{% endif %})
{%- endfor %}
{% if risks %}
## Risks
{% for r in risks %}
- {{ r }}
{%- endfor %}
{% endif %}{% if notes %}
## Migration notes
{% for n in notes %}
- {{ n }}
{%- endfor %}
{% endif %}
## Class diagram

```mermaid
{{ diagram }}
```
"#;

/// Produces the `documentation`.
pub struct DocumenterAgent {
    backend: Arc<dyn InferenceBackend>,
    generation: GenerationConfig,
}

impl DocumenterAgent {
    pub fn new(backend: Arc<dyn InferenceBackend>, generation: GenerationConfig) -> Self {
        Self {
            backend,
            generation,
        }
    }
}

#[async_trait]
impl Stage for DocumenterAgent {
    fn id(&self) -> StageId {
        StageId::Documenter
    }

    async fn run(&self, state: &PipelineState, _context: &PreparedContext) -> StageResult<StageReport> {
        let schema = require(StageId::Documenter, state.logic_schema(), "logic_schema")?;
        let mapping = require(StageId::Documenter, state.design_mapping(), "design_mapping")?;
        let artifact = require(StageId::Documenter, state.generated_artifact(), "generated_artifact")?;
        let validation = require(StageId::Documenter, state.validation_result(), "validation_result")?;
        let source = state.source();

        let pattern_lines: Vec<String> = mapping
            .patterns
            .iter()
            .map(|p| format!("{} -> {}", p.legacy, p.target))
            .collect();
        let prompt = build_documentation_prompt(
            &source.file_name,
            &artifact.language,
            &schema.flow_description,
            &pattern_lines,
            artifact.attempt,
        );
        let reply = self
            .backend
            .complete(&prompt, &self.generation)
            .await
            .map_err(|e| StageError::backend(StageId::Documenter, e))?;
        let narrative = reply.trim().to_string();
        if narrative.is_empty() {
            return Err(StageError::malformed(StageId::Documenter, "empty narrative"));
        }

        let diagram = class_diagram(schema, source.stem());

        let mut notes = schema.notes.clone();
        notes.extend(state.warnings().iter().cloned());

        let mut context = Context::new();
        context.insert("source_file", &source.file_name);
        context.insert("source_language", source.language.as_str());
        context.insert("source_lines", &schema.line_count);
        context.insert("artifact_file", &artifact.file_name);
        context.insert("target_language", &artifact.language);
        context.insert("generated_lines", &artifact.line_count());
        context.insert("strategy", schema.strategy.as_str());
        context.insert("attempts", &artifact.attempt);
        context.insert("pass_rate", &format!("{:.0}%", validation.pass_rate * 100.0));
        context.insert("complexity", &schema.control_flow.cyclomatic_complexity);
        context.insert("flow_description", &schema.flow_description);
        context.insert("narrative", &narrative);
        context.insert("patterns", &mapping.patterns);
        context.insert("history", state.validation_history());
        context.insert("risks", &mapping.risks);
        context.insert("notes", &notes);
        context.insert("diagram", &diagram);

        let markdown = Tera::one_off(REPORT_TEMPLATE, &context, false).map_err(|e| {
            StageError::Internal {
                stage: StageId::Documenter,
                message: format!("report template failed: {}", e),
            }
        })?;

        let message = format!("report for {} ({} bytes)", artifact.file_name, markdown.len());
        Ok(StageReport::new(
            StageOutput::Documentation(Documentation {
                markdown,
                narrative,
                diagram,
            }),
            message,
        ))
    }
}

/// Mermaid class diagram of the ported module.
fn class_diagram(schema: &LogicSchema, module: &str) -> String {
    let mut out = String::from("classDiagram\n");
    let module = snake_case(module);

    for class in &schema.classes {
        let name = pascal_case(&class.name);
        if class.fields.is_empty() && class.methods.is_empty() {
            out.push_str(&format!("    class {}\n", name));
            continue;
        }
        out.push_str(&format!("    class {} {{\n", name));
        if class.is_singleton {
            out.push_str("        <<singleton>>\n");
        }
        for field in &class.fields {
            out.push_str(&format!("        +{}\n", snake_case(field)));
        }
        for method in &class.methods {
            out.push_str(&format!("        +{}()\n", snake_case(method)));
        }
        out.push_str("    }\n");
    }

    let free: Vec<String> = schema
        .functions
        .iter()
        .filter(|f| f.owner.is_none())
        .map(|f| snake_case(&f.name))
        .collect();
    out.push_str(&format!("    class {} {{\n        <<module>>\n", module));
    for function in &free {
        out.push_str(&format!("        +{}()\n", function));
    }
    out.push_str("    }\n");
    for class in &schema.classes {
        out.push_str(&format!("    {} --> {}\n", module, pascal_case(&class.name)));
    }

    out
}
