//! Stage identifiers and the stage contract.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::error::{StageError, StageResult};
use crate::context::{PreparedContext, StageObjective};

use super::state::{
    DesignMapping, Documentation, GeneratedArtifact, LogicSchema, PipelineState, ValidationResult,
};

/// The five pipeline stages, in nominal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Extractor,
    Mapper,
    Generator,
    Validator,
    Documenter,
}

impl StageId {
    /// All stages in nominal order.
    pub const ALL: [StageId; 5] = [
        StageId::Extractor,
        StageId::Mapper,
        StageId::Generator,
        StageId::Validator,
        StageId::Documenter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Extractor => "extractor",
            StageId::Mapper => "mapper",
            StageId::Generator => "generator",
            StageId::Validator => "validator",
            StageId::Documenter => "documenter",
        }
    }

    /// 1-based position in the nominal order.
    pub fn position(&self) -> usize {
        match self {
            StageId::Extractor => 1,
            StageId::Mapper => 2,
            StageId::Generator => 3,
            StageId::Validator => 4,
            StageId::Documenter => 5,
        }
    }

    /// Fraction of the pipeline done once this stage completes.
    pub fn progress(&self) -> f32 {
        self.position() as f32 / Self::ALL.len() as f32
    }

    /// Retrieval framing used when this stage asks for a context view.
    ///
    /// The mapper works from the schema alone and never reads the source.
    pub fn objective(&self) -> Option<StageObjective> {
        match self {
            StageId::Extractor => Some(StageObjective::Extraction),
            StageId::Mapper => None,
            StageId::Generator => Some(StageObjective::Generation),
            StageId::Validator => Some(StageObjective::Validation),
            StageId::Documenter => Some(StageObjective::Documentation),
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// The field a stage produces. Exactly one per stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Schema(LogicSchema),
    Mapping(DesignMapping),
    Artifact(GeneratedArtifact),
    Validation(ValidationResult),
    Documentation(Documentation),
}

impl StageOutput {
    /// The stage that produces this output.
    pub fn stage(&self) -> StageId {
        match self {
            StageOutput::Schema(_) => StageId::Extractor,
            StageOutput::Mapping(_) => StageId::Mapper,
            StageOutput::Artifact(_) => StageId::Generator,
            StageOutput::Validation(_) => StageId::Validator,
            StageOutput::Documentation(_) => StageId::Documenter,
        }
    }
}

/// Result of one stage invocation, committed by the orchestrator in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub output: StageOutput,
    /// Short human-readable outcome for progress events.
    pub message: String,
    /// Stage-local warnings; never affect routing.
    pub warnings: Vec<String>,
}

impl StageReport {
    pub fn new(output: StageOutput, message: impl Into<String>) -> Self {
        Self {
            output,
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// A unit of work in the pipeline.
///
/// Stages read the state and the prepared context but never mutate them;
/// the orchestrator commits the returned output.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(&self, state: &PipelineState, context: &PreparedContext)
        -> StageResult<StageReport>;
}

/// Returns a stage error if a prerequisite field is missing.
pub(crate) fn require<'a, T>(
    stage: StageId,
    value: Option<&'a T>,
    field: &str,
) -> Result<&'a T, StageError> {
    value.ok_or_else(|| StageError::Internal {
        stage,
        message: format!("{} has not been produced yet", field),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_progress() {
        let positions: Vec<usize> = StageId::ALL.iter().map(StageId::position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
        assert!((StageId::Documenter.progress() - 1.0).abs() < f32::EPSILON);
        assert!((StageId::Generator.progress() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_stage_parse_and_display() {
        assert_eq!("Validator".parse::<StageId>().unwrap(), StageId::Validator);
        assert_eq!(StageId::Mapper.to_string(), "mapper");
        assert!("linker".parse::<StageId>().is_err());
    }

    #[test]
    fn test_mapper_has_no_objective() {
        assert!(StageId::Mapper.objective().is_none());
        assert_eq!(
            StageId::Extractor.objective(),
            Some(StageObjective::Extraction)
        );
    }
}
