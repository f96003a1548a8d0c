//! Pipeline orchestration for legacy-code modernization.
//!
//! A job moves one legacy source file through five stages that share a
//! single [`PipelineState`]:
//!
//! 1. **Extractor**: structural summary of the source (`logic_schema`)
//! 2. **Mapper**: legacy pattern to target idiom plan (`design_mapping`)
//! 3. **Generator**: target-language code (`generated_artifact`)
//! 4. **Validator**: checks on the artifact (`validation_result`)
//! 5. **Documenter**: human-readable summary (`documentation`)
//!
//! The [`router`] decides the next stage from the state alone. A failed
//! validation loops back to the generator until `max_retries` failures have
//! been recorded; every other failure ends the job.
//!
//! # Example
//!
//! ```rust,ignore
//! use legacy_forge::context::{ContextConfig, ContextManager};
//! use legacy_forge::llm::{MockBackend, SerializedBackend};
//! use legacy_forge::pipeline::{Orchestrator, PipelineConfig, ProgressSink, SourceDocument, SourceLanguage};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use uuid::Uuid;
//!
//! let backend = Arc::new(SerializedBackend::new(Arc::new(MockBackend::new()), 1));
//! let context = ContextManager::new(ContextConfig::from_env()?)?;
//! let orchestrator = Orchestrator::new(PipelineConfig::from_env()?, context, backend)?;
//!
//! let source = SourceDocument::new(text, SourceLanguage::Cpp, "engine.cpp");
//! let sink = ProgressSink::disabled(Uuid::new_v4());
//! let state = orchestrator.run(sink.job_id(), source, &sink, &CancellationToken::new()).await;
//! println!("{}: {}", state.job_id(), state.status());
//! ```

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod router;
pub mod stage;
pub mod state;

pub use config::{ConfigError, PipelineConfig};
pub use events::{EventKind, ProgressEvent, ProgressSink, StageStatus};
pub use orchestrator::Orchestrator;
pub use router::{Route, RETRY_BUDGET_EXHAUSTED};
pub use stage::{Stage, StageId, StageOutput, StageReport};
pub use state::{
    ClassInfo, ControlFlow, DesignMapping, Documentation, ErrorRecord, FailureKind, FunctionInfo,
    GeneratedArtifact, LogicSchema, PatternMapping, PipelineState, PipelineStatus, ResourceKind,
    ResourcePattern, SourceDocument, SourceLanguage, ValidationFailure, ValidationResult,
};
