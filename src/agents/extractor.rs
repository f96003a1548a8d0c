//! Extractor stage: structural summary of the legacy source.
//!
//! The lexical scan of the whole file is the baseline. The backend's
//! analysis of the prepared context (the full text, each window in turn, or
//! the retrieval view) is merged onto it by name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::context::{ContextView, PreparedContext, StageObjective};
use crate::llm::{GenerationConfig, InferenceBackend};
use crate::pipeline::stage::{Stage, StageId, StageOutput, StageReport};
use crate::pipeline::state::{ClassInfo, FunctionInfo, LogicSchema, PipelineState};
use crate::prompts::build_extraction_prompt;
use crate::utils::extract_json;

use super::error::{StageError, StageResult};
use super::scan::{scan, LexicalScan};

/// Backend reply for one view of the source.
#[derive(Debug, Default, Deserialize)]
struct BackendAnalysis {
    #[serde(default)]
    classes: Vec<ClassInfo>,
    #[serde(default)]
    functions: Vec<FunctionInfo>,
    #[serde(default)]
    flow_description: Option<String>,
    #[serde(default)]
    notes: Vec<String>,
}

/// Produces the `logic_schema`.
pub struct ExtractorAgent {
    backend: Arc<dyn InferenceBackend>,
    generation: GenerationConfig,
}

impl ExtractorAgent {
    pub fn new(backend: Arc<dyn InferenceBackend>, generation: GenerationConfig) -> Self {
        Self {
            backend,
            generation,
        }
    }

    async fn analyze(
        &self,
        state: &PipelineState,
        view: &str,
        part: Option<(usize, usize)>,
    ) -> StageResult<BackendAnalysis> {
        let source = state.source();
        let prompt = build_extraction_prompt(source.language, &source.file_name, view, part);
        let reply = self
            .backend
            .complete(&prompt, &self.generation)
            .await
            .map_err(|e| StageError::backend(StageId::Extractor, e))?;

        extract_json::<BackendAnalysis>(&reply)
            .map_err(|e| StageError::malformed(StageId::Extractor, e.to_string()))
    }
}

#[async_trait]
impl Stage for ExtractorAgent {
    fn id(&self) -> StageId {
        StageId::Extractor
    }

    async fn run(&self, state: &PipelineState, context: &PreparedContext) -> StageResult<StageReport> {
        let source = state.source();
        let lexical = scan(&source.text, source.language, 1);
        let focus: Vec<String> = lexical
            .classes
            .iter()
            .map(|c| c.name.clone())
            .chain(lexical.functions.iter().map(|f| f.name.clone()))
            .collect();

        let view = context
            .view(StageObjective::Extraction, &focus)
            .map_err(|e| StageError::context(StageId::Extractor, e))?;

        let analyses = match &view {
            ContextView::Windows(chunks) => {
                let mut analyses = Vec::with_capacity(chunks.len());
                for chunk in chunks.iter() {
                    debug!(window = chunk.index, lines = ?(chunk.start_line, chunk.end_line), "Analyzing window");
                    analyses.push(
                        self.analyze(state, &chunk.text, Some((chunk.index, chunks.len())))
                            .await?,
                    );
                }
                analyses
            }
            other => vec![self.analyze(state, &other.render(), None).await?],
        };

        let schema = merge(lexical, analyses, context);
        let message = format!(
            "{} classes, {} functions, {} resource sites ({})",
            schema.classes.len(),
            schema.functions.len(),
            schema.resource_patterns.len(),
            schema.strategy
        );
        Ok(StageReport::new(StageOutput::Schema(schema), message))
    }
}

/// Merges backend analyses onto the lexical scan.
fn merge(lexical: LexicalScan, analyses: Vec<BackendAnalysis>, context: &PreparedContext) -> LogicSchema {
    let mut classes = lexical.classes;
    let mut functions = lexical.functions;
    let mut descriptions = Vec::new();
    let mut notes = Vec::new();

    for analysis in analyses {
        for class in analysis.classes {
            if class.name.trim().is_empty() {
                continue;
            }
            match classes.iter_mut().find(|c| c.name == class.name) {
                Some(existing) => {
                    union_into(&mut existing.methods, class.methods);
                    union_into(&mut existing.fields, class.fields);
                    existing.is_singleton |= class.is_singleton;
                }
                None => classes.push(class),
            }
        }

        for function in analysis.functions {
            if function.name.trim().is_empty() {
                continue;
            }
            match functions.iter_mut().find(|f| f.name == function.name) {
                Some(existing) => {
                    if existing.params.is_empty() {
                        existing.params = function.params;
                    }
                    if existing.return_type.is_none() {
                        existing.return_type = function.return_type;
                    }
                    existing.performs_io |= function.performs_io;
                    existing.loop_count = existing.loop_count.max(function.loop_count);
                }
                None => functions.push(function),
            }
        }

        if let Some(description) = analysis.flow_description {
            let description = description.trim().to_string();
            if !description.is_empty() && !descriptions.contains(&description) {
                descriptions.push(description);
            }
        }
        union_into(&mut notes, analysis.notes);
    }

    let flow_description = if descriptions.is_empty() {
        format!(
            "Defines {} classes and {} functions across {} lines.",
            classes.len(),
            functions.len(),
            lexical.line_count
        )
    } else {
        descriptions.join(" ")
    };

    if let Some(tokens) = context.token_estimate() {
        notes.push(format!("source estimated at {} tokens", tokens));
    }

    LogicSchema {
        classes,
        functions,
        includes: lexical.includes,
        resource_patterns: lexical.resource_patterns,
        control_flow: lexical.control_flow,
        flow_description,
        line_count: lexical.line_count,
        strategy: context.strategy(),
        notes,
    }
}

fn union_into(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !item.trim().is_empty() && !target.contains(&item) {
            target.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::context::{ContextConfig, ContextManager, ContextStrategy};
    use crate::llm::{MockBackend, MockFailure};
    use crate::pipeline::state::{ResourceKind, SourceDocument, SourceLanguage};
    use crate::agents::error::FailureCategory;

    const SOURCE: &str = "#include <vector>\n\nclass Matrix {\npublic:\n    int rows;\n};\n\nstruct Cell { int v; };\n\nint main() {\n    Matrix* m = new Matrix();\n    delete m;\n    return 0;\n}\n";

    fn state(text: &str) -> PipelineState {
        let mut state = PipelineState::new(
            Uuid::new_v4(),
            SourceDocument::new(text, SourceLanguage::Cpp, "matrix.cpp"),
            3,
        );
        state.start().unwrap();
        state
    }

    #[tokio::test]
    async fn test_direct_extraction_merges_scan_and_backend() {
        let backend = Arc::new(MockBackend::new());
        let agent = ExtractorAgent::new(backend.clone(), GenerationConfig::default());
        let context = ContextManager::new(ContextConfig::default())
            .unwrap()
            .prepare(SOURCE)
            .unwrap();

        let report = agent.run(&state(SOURCE), &context).await.unwrap();
        let StageOutput::Schema(schema) = report.output else {
            panic!("expected schema");
        };

        let names: Vec<&str> = schema.classes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Matrix", "Cell"]);
        assert_eq!(schema.strategy, ContextStrategy::Direct);
        assert_eq!(schema.includes, vec!["vector"]);
        assert!(schema.has_resource(ResourceKind::ManualAllocation));
        assert!(schema.has_resource(ResourceKind::ManualRelease));
        assert!(schema.flow_description.contains("mock analysis"));
        assert!(schema.functions.iter().any(|f| f.name == "main"));
        assert_eq!(backend.calls(StageId::Extractor), 1);
    }

    #[tokio::test]
    async fn test_windowed_extraction_calls_backend_per_window() {
        let text: String = (0..40)
            .map(|i| format!("class Widget{i} {{\npublic:\n    int value;\n}};\n\n"))
            .collect();
        let backend = Arc::new(MockBackend::new());
        let agent = ExtractorAgent::new(backend.clone(), GenerationConfig::default());
        let config = ContextConfig::default()
            .with_thresholds(20, 100_000)
            .with_chunking(64, 8);
        let context = ContextManager::new(config).unwrap().prepare(&text).unwrap();
        assert_eq!(context.strategy(), ContextStrategy::Windowed);

        let report = agent.run(&state(&text), &context).await.unwrap();
        let StageOutput::Schema(schema) = report.output else {
            panic!("expected schema");
        };

        assert_eq!(backend.calls(StageId::Extractor), context.chunks().len());
        assert_eq!(schema.classes.len(), 40);
        assert_eq!(schema.strategy, ContextStrategy::Windowed);
        // Descriptions repeated by every window are kept once.
        assert_eq!(schema.flow_description.matches("mock analysis").count(), 1);
    }

    #[tokio::test]
    async fn test_blank_reply_is_malformed() {
        let backend =
            Arc::new(MockBackend::new().with_failure(StageId::Extractor, MockFailure::Malformed));
        let agent = ExtractorAgent::new(backend, GenerationConfig::default());
        let context = ContextManager::new(ContextConfig::default())
            .unwrap()
            .prepare(SOURCE)
            .unwrap();

        let err = agent.run(&state(SOURCE), &context).await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::MalformedResponse);
    }

    #[test]
    fn test_merge_unions_by_name() {
        let lexical = LexicalScan {
            classes: vec![ClassInfo {
                name: "Pool".to_string(),
                methods: vec!["get".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let analysis = BackendAnalysis {
            classes: vec![
                ClassInfo {
                    name: "Pool".to_string(),
                    methods: vec!["get".to_string(), "put".to_string()],
                    is_singleton: true,
                    ..Default::default()
                },
                ClassInfo {
                    name: "Block".to_string(),
                    ..Default::default()
                },
            ],
            functions: vec![FunctionInfo {
                name: "drain".to_string(),
                ..Default::default()
            }],
            flow_description: Some("Pools blocks.".to_string()),
            notes: vec![String::new()],
        };
        let context = ContextManager::new(ContextConfig::default())
            .unwrap()
            .prepare("class Pool {};")
            .unwrap();

        let schema = merge(lexical, vec![analysis], &context);
        assert_eq!(schema.classes.len(), 2);
        assert_eq!(schema.classes[0].methods, vec!["get", "put"]);
        assert!(schema.classes[0].is_singleton);
        assert_eq!(schema.functions[0].name, "drain");
        assert_eq!(schema.flow_description, "Pools blocks.");
        assert_eq!(schema.notes.len(), 1);
    }
}
