//! The per-job pipeline state.
//!
//! One `PipelineState` is threaded through every stage of a job. Fields are
//! private; stages read through getters and the orchestrator commits stage
//! output through [`PipelineState::apply`], which enforces the lifecycle:
//!
//! - `logic_schema` and `design_mapping` are forward-only.
//! - `generated_artifact` and `validation_result` are overwritten per attempt
//!   and require their producer's input to exist first.
//! - `retry_count` only grows and never passes `max_retries`.
//! - Once `completed` or `failed`, every mutation is rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::agents::error::StageError;
use crate::context::ContextStrategy;
use crate::error::StateError;

use super::config::ConfigError;
use super::stage::{StageId, StageOutput};

/// Languages accepted as legacy input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLanguage {
    Cpp,
    Java,
}

impl SourceLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLanguage::Cpp => "cpp",
            SourceLanguage::Java => "java",
        }
    }

    /// Guesses the language from a file extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "h" | "c" => Some(SourceLanguage::Cpp),
            "java" => Some(SourceLanguage::Java),
            _ => None,
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceLanguage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" | "cxx" => Ok(SourceLanguage::Cpp),
            "java" => Ok(SourceLanguage::Java),
            other => Err(ConfigError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// The legacy input. Immutable for the life of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    pub language: SourceLanguage,
    pub file_name: String,
}

impl SourceDocument {
    pub fn new(text: impl Into<String>, language: SourceLanguage, file_name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language,
            file_name: file_name.into(),
        }
    }

    /// File name without directory or extension.
    pub fn stem(&self) -> &str {
        let base = self
            .file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_name);
        match base.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => base,
        }
    }
}

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A class or struct found in the source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub is_singleton: bool,
}

/// A free function or method found in the source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    /// Enclosing class for methods.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub return_type: Option<String>,
    #[serde(default)]
    pub loop_count: usize,
    #[serde(default)]
    pub performs_io: bool,
}

/// Kinds of manual resource handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ManualAllocation,
    ManualRelease,
    RawPointer,
    FileHandle,
    Lock,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ManualAllocation => "manual_allocation",
            ResourceKind::ManualRelease => "manual_release",
            ResourceKind::RawPointer => "raw_pointer",
            ResourceKind::FileHandle => "file_handle",
            ResourceKind::Lock => "lock",
        }
    }
}

/// One resource-ownership site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePattern {
    pub kind: ResourceKind,
    pub symbol: String,
    pub line: usize,
}

/// Coarse control-flow shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlFlow {
    pub branches: usize,
    pub loops: usize,
    pub max_nesting: usize,
    pub cyclomatic_complexity: usize,
}

/// Structural summary of the legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogicSchema {
    pub classes: Vec<ClassInfo>,
    pub functions: Vec<FunctionInfo>,
    pub includes: Vec<String>,
    pub resource_patterns: Vec<ResourcePattern>,
    pub control_flow: ControlFlow,
    pub flow_description: String,
    pub line_count: usize,
    /// Strategy the source was fed with.
    pub strategy: ContextStrategy,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl LogicSchema {
    pub fn has_resource(&self, kind: ResourceKind) -> bool {
        self.resource_patterns.iter().any(|p| p.kind == kind)
    }
}

/// One legacy pattern and its target idiom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMapping {
    pub legacy: String,
    pub target: String,
    pub symbols: Vec<String>,
}

/// Translation plan from the schema to the target language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignMapping {
    pub target_language: String,
    pub patterns: Vec<PatternMapping>,
    /// Legacy symbol to target symbol.
    pub symbol_map: BTreeMap<String, String>,
    pub risks: Vec<String>,
    pub rationale: String,
}

/// Generated code for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub code: String,
    pub language: String,
    pub file_name: String,
    /// 1 for the first attempt.
    pub attempt: u32,
    /// SHA-256 of `code`, hex encoded.
    pub content_hash: String,
    /// Failures from the previous validation this attempt responded to.
    pub addressed_failures: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl GeneratedArtifact {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        file_name: impl Into<String>,
        attempt: u32,
        addressed_failures: Vec<String>,
    ) -> Self {
        let code = code.into();
        let content_hash = content_hash(&code);
        Self {
            code,
            language: language.into(),
            file_name: file_name.into(),
            attempt,
            content_hash,
            addressed_failures,
            generated_at: Utc::now(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.code.lines().count()
    }
}

/// SHA-256 of `text` as lowercase hex.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Category of a single validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Logic,
    Runtime,
    Critical,
    /// Advisory only; does not fail validation.
    Style,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Logic => "logic",
            FailureKind::Runtime => "runtime",
            FailureKind::Critical => "critical",
            FailureKind::Style => "style",
        }
    }

    /// Parses a backend-reported category, defaulting to logic.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("style") => FailureKind::Style,
            Some("runtime") | Some("error") => FailureKind::Runtime,
            Some("critical") | Some("security") => FailureKind::Critical,
            _ => FailureKind::Logic,
        }
    }
}

/// One itemized validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub check: String,
    pub category: FailureKind,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(check: impl Into<String>, category: FailureKind, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.category.as_str(), self.check, self.message)
    }
}

/// Outcome of validating one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    /// Fraction of checks that passed, in `[0, 1]`.
    pub pass_rate: f64,
    pub checks_run: usize,
    pub failures: Vec<ValidationFailure>,
    /// Attempt number of the validated artifact.
    pub attempt: u32,
    pub artifact_hash: String,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
}

impl ValidationResult {
    /// Builds a result from the checks that ran and the ones that failed.
    ///
    /// Passes iff every failure is a style failure.
    pub fn from_checks(
        artifact: &GeneratedArtifact,
        checks_run: usize,
        failures: Vec<ValidationFailure>,
    ) -> Self {
        let failed = failures.len().min(checks_run);
        let pass_rate = if checks_run == 0 {
            0.0
        } else {
            (checks_run - failed) as f64 / checks_run as f64
        };
        Self {
            passed: checks_run > 0 && failures.iter().all(|f| f.category == FailureKind::Style),
            pass_rate,
            checks_run,
            failures,
            attempt: artifact.attempt,
            artifact_hash: artifact.content_hash.clone(),
            root_cause: None,
            suggested_fixes: Vec::new(),
        }
    }

    pub fn with_diagnosis(mut self, root_cause: Option<String>, suggested_fixes: Vec<String>) -> Self {
        self.root_cause = root_cause;
        self.suggested_fixes = suggested_fixes;
        self
    }

    /// Failures that block the pipeline.
    pub fn blocking_failures(&self) -> impl Iterator<Item = &ValidationFailure> {
        self.failures
            .iter()
            .filter(|f| f.category != FailureKind::Style)
    }
}

/// Human-readable summary of the finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Documentation {
    pub markdown: String,
    pub narrative: String,
    /// Mermaid class diagram.
    pub diagram: String,
}

/// One entry in the job's error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Option<StageId>,
    pub category: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(stage: Option<StageId>, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            category: category.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&StageError> for ErrorRecord {
    fn from(err: &StageError) -> Self {
        ErrorRecord::new(Some(err.stage()), err.category().as_str(), err.to_string())
    }
}

/// Shared state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    job_id: Uuid,
    source: SourceDocument,
    status: PipelineStatus,
    max_retries: u32,
    retry_count: u32,
    context_strategy: Option<ContextStrategy>,
    logic_schema: Option<LogicSchema>,
    design_mapping: Option<DesignMapping>,
    generated_artifact: Option<GeneratedArtifact>,
    validation_result: Option<ValidationResult>,
    validation_history: Vec<ValidationResult>,
    documentation: Option<Documentation>,
    errors: Vec<ErrorRecord>,
    warnings: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Creates a pending state.
    pub fn new(job_id: Uuid, source: SourceDocument, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            source,
            status: PipelineStatus::Pending,
            max_retries,
            retry_count: 0,
            context_strategy: None,
            logic_schema: None,
            design_mapping: None,
            generated_artifact: None,
            validation_result: None,
            validation_history: Vec::new(),
            documentation: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn source(&self) -> &SourceDocument {
        &self.source
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn context_strategy(&self) -> Option<ContextStrategy> {
        self.context_strategy
    }

    pub fn logic_schema(&self) -> Option<&LogicSchema> {
        self.logic_schema.as_ref()
    }

    pub fn design_mapping(&self) -> Option<&DesignMapping> {
        self.design_mapping.as_ref()
    }

    pub fn generated_artifact(&self) -> Option<&GeneratedArtifact> {
        self.generated_artifact.as_ref()
    }

    pub fn validation_result(&self) -> Option<&ValidationResult> {
        self.validation_result.as_ref()
    }

    /// Every validation result, oldest first.
    pub fn validation_history(&self) -> &[ValidationResult] {
        &self.validation_history
    }

    pub fn documentation(&self) -> Option<&Documentation> {
        self.documentation.as_ref()
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Attempt number the next generator run will carry.
    pub fn next_attempt(&self) -> u32 {
        self.generated_artifact
            .as_ref()
            .map(|a| a.attempt + 1)
            .unwrap_or(1)
    }

    fn ensure_mutable(&self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Frozen(self.status.to_string()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// `pending` to `running`.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if self.status != PipelineStatus::Pending {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: PipelineStatus::Running.to_string(),
            });
        }
        self.status = PipelineStatus::Running;
        self.touch();
        Ok(())
    }

    /// Records the context strategy chosen for this job. Set once.
    pub fn record_context(
        &mut self,
        strategy: ContextStrategy,
        warnings: &[String],
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if self.context_strategy.is_some() {
            return Err(StateError::AlreadySet("context_strategy"));
        }
        self.context_strategy = Some(strategy);
        self.warnings.extend(warnings.iter().cloned());
        self.touch();
        Ok(())
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.warnings.push(warning.into());
        self.touch();
        Ok(())
    }

    /// Commits one stage output.
    ///
    /// A failed validation increments `retry_count`; a failed validation
    /// once the budget is spent is rejected.
    pub fn apply(&mut self, output: StageOutput) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if self.status != PipelineStatus::Running {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: format!("{} commit", output.stage()),
            });
        }

        match output {
            StageOutput::Schema(schema) => {
                if self.logic_schema.is_some() {
                    return Err(StateError::AlreadySet("logic_schema"));
                }
                self.logic_schema = Some(schema);
            }
            StageOutput::Mapping(mapping) => {
                if self.logic_schema.is_none() {
                    return Err(StateError::MissingPrerequisite {
                        field: "design_mapping",
                        requires: "logic_schema",
                    });
                }
                if self.design_mapping.is_some() {
                    return Err(StateError::AlreadySet("design_mapping"));
                }
                self.design_mapping = Some(mapping);
            }
            StageOutput::Artifact(artifact) => {
                if self.design_mapping.is_none() {
                    return Err(StateError::MissingPrerequisite {
                        field: "generated_artifact",
                        requires: "design_mapping",
                    });
                }
                self.generated_artifact = Some(artifact);
            }
            StageOutput::Validation(result) => {
                if self.generated_artifact.is_none() {
                    return Err(StateError::MissingPrerequisite {
                        field: "validation_result",
                        requires: "generated_artifact",
                    });
                }
                if !result.passed {
                    if self.retry_count >= self.max_retries {
                        return Err(StateError::RetryBudgetExceeded {
                            max: self.max_retries,
                        });
                    }
                    self.retry_count += 1;
                }
                self.validation_history.push(result.clone());
                self.validation_result = Some(result);
            }
            StageOutput::Documentation(docs) => {
                if !self.validation_result.as_ref().is_some_and(|v| v.passed) {
                    return Err(StateError::MissingPrerequisite {
                        field: "documentation",
                        requires: "passing validation_result",
                    });
                }
                if self.documentation.is_some() {
                    return Err(StateError::AlreadySet("documentation"));
                }
                self.documentation = Some(docs);
            }
        }

        self.touch();
        Ok(())
    }

    /// `running` to `completed`.
    pub fn complete(&mut self) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if self.status != PipelineStatus::Running {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: PipelineStatus::Completed.to_string(),
            });
        }
        self.status = PipelineStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Records `record` and moves to `failed`.
    pub fn fail(&mut self, record: ErrorRecord) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.errors.push(record);
        self.status = PipelineStatus::Failed;
        self.touch();
        Ok(())
    }

    /// The reason for failure, if the job failed.
    pub fn failure(&self) -> Option<&ErrorRecord> {
        if self.status == PipelineStatus::Failed {
            self.errors.last()
        } else {
            None
        }
    }
}
