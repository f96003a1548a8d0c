//! Next-stage decisions.
//!
//! [`next`] is a pure function of the state. Before the first validation
//! the order is fixed (extractor, mapper, generator, validator). After it:
//!
//! | validation passed | retry_count < max_retries | route      |
//! |-------------------|---------------------------|------------|
//! | yes               | any                       | documenter |
//! | no                | yes                       | generator  |
//! | no                | no                        | fail       |
//!
//! `retry_count` is incremented when a failed validation is committed, so
//! by the time the router sees a failure the count already includes it.

use super::stage::StageId;
use super::state::{PipelineState, PipelineStatus};

/// Category recorded when the retry budget runs out.
pub const RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";

/// What the orchestrator should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Invoke a stage.
    Run(StageId),
    /// All stages done; mark the job completed.
    Complete,
    /// Validation kept failing; mark the job failed with this reason.
    Fail(String),
    /// The state is already terminal.
    Halt,
}

/// Decides the next step for `state`.
pub fn next(state: &PipelineState) -> Route {
    if state.status().is_terminal() {
        return Route::Halt;
    }
    if state.status() == PipelineStatus::Pending {
        return Route::Run(StageId::Extractor);
    }

    if state.logic_schema().is_none() {
        return Route::Run(StageId::Extractor);
    }
    if state.design_mapping().is_none() {
        return Route::Run(StageId::Mapper);
    }
    let Some(artifact) = state.generated_artifact() else {
        return Route::Run(StageId::Generator);
    };

    let validation = match state.validation_result() {
        Some(v) if v.attempt >= artifact.attempt => v,
        _ => return Route::Run(StageId::Validator),
    };

    if validation.passed {
        return if state.documentation().is_some() {
            Route::Complete
        } else {
            Route::Run(StageId::Documenter)
        };
    }

    if state.retry_count() < state.max_retries() {
        Route::Run(StageId::Generator)
    } else {
        let failures: Vec<String> = validation
            .blocking_failures()
            .map(|f| f.to_string())
            .collect();
        Route::Fail(format!(
            "validation failed after {} attempt(s): {}",
            artifact.attempt,
            failures.join("; ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use super::*;
    use crate::context::ContextStrategy;
    use crate::pipeline::stage::StageOutput;
    use crate::pipeline::state::{
        ControlFlow, DesignMapping, Documentation, ErrorRecord, FailureKind, GeneratedArtifact,
        LogicSchema, SourceDocument, SourceLanguage, ValidationFailure, ValidationResult,
    };

    fn state(max_retries: u32) -> PipelineState {
        let source = SourceDocument::new("class A {};", SourceLanguage::Cpp, "a.cpp");
        let mut state = PipelineState::new(Uuid::new_v4(), source, max_retries);
        state.start().unwrap();
        state
    }

    fn schema() -> StageOutput {
        StageOutput::Schema(LogicSchema {
            classes: Vec::new(),
            functions: Vec::new(),
            includes: Vec::new(),
            resource_patterns: Vec::new(),
            control_flow: ControlFlow::default(),
            flow_description: String::new(),
            line_count: 1,
            strategy: ContextStrategy::Direct,
            notes: Vec::new(),
        })
    }

    fn mapping() -> StageOutput {
        StageOutput::Mapping(DesignMapping {
            target_language: "python".to_string(),
            patterns: Vec::new(),
            symbol_map: BTreeMap::new(),
            risks: Vec::new(),
            rationale: String::new(),
        })
    }

    fn generate(state: &mut PipelineState) {
        let attempt = state.next_attempt();
        let artifact =
            GeneratedArtifact::new(format!("# v{attempt}\n"), "python", "a.py", attempt, Vec::new());
        state.apply(StageOutput::Artifact(artifact)).unwrap();
    }

    fn validate(state: &mut PipelineState, passed: bool) {
        let artifact = state.generated_artifact().unwrap().clone();
        let failures = if passed {
            Vec::new()
        } else {
            vec![ValidationFailure::new("test_x", FailureKind::Logic, "boom")]
        };
        let result = ValidationResult::from_checks(&artifact, 3, failures);
        state.apply(StageOutput::Validation(result)).unwrap();
    }

    fn docs() -> StageOutput {
        StageOutput::Documentation(Documentation {
            markdown: String::new(),
            narrative: String::new(),
            diagram: String::new(),
        })
    }

    #[test]
    fn test_fixed_forward_order() {
        let mut s = state(3);
        assert_eq!(next(&s), Route::Run(StageId::Extractor));
        s.apply(schema()).unwrap();
        assert_eq!(next(&s), Route::Run(StageId::Mapper));
        s.apply(mapping()).unwrap();
        assert_eq!(next(&s), Route::Run(StageId::Generator));
        generate(&mut s);
        assert_eq!(next(&s), Route::Run(StageId::Validator));
    }

    #[test]
    fn test_pass_routes_to_documenter_then_complete() {
        let mut s = state(3);
        s.apply(schema()).unwrap();
        s.apply(mapping()).unwrap();
        generate(&mut s);
        validate(&mut s, true);
        assert_eq!(next(&s), Route::Run(StageId::Documenter));
        s.apply(docs()).unwrap();
        assert_eq!(next(&s), Route::Complete);
    }

    #[test]
    fn test_failure_routes_back_to_generator_then_validator() {
        let mut s = state(3);
        s.apply(schema()).unwrap();
        s.apply(mapping()).unwrap();
        generate(&mut s);
        validate(&mut s, false);
        assert_eq!(s.retry_count(), 1);
        assert_eq!(next(&s), Route::Run(StageId::Generator));

        generate(&mut s);
        assert_eq!(next(&s), Route::Run(StageId::Validator));
    }

    #[test]
    fn test_budget_exhaustion_fails() {
        let mut s = state(2);
        s.apply(schema()).unwrap();
        s.apply(mapping()).unwrap();
        generate(&mut s);
        validate(&mut s, false);
        generate(&mut s);
        validate(&mut s, false);

        match next(&s) {
            Route::Fail(reason) => {
                assert!(reason.contains("2 attempt(s)"));
                assert!(reason.contains("test_x"));
            }
            other => panic!("expected fail, got {:?}", other),
        }
    }

    #[test]
    fn test_generator_selected_at_most_max_retries_times() {
        for max in 1..=5 {
            let mut s = state(max);
            let mut generator_runs = 0;
            loop {
                match next(&s) {
                    Route::Run(StageId::Extractor) => s.apply(schema()).unwrap(),
                    Route::Run(StageId::Mapper) => s.apply(mapping()).unwrap(),
                    Route::Run(StageId::Generator) => {
                        generator_runs += 1;
                        generate(&mut s);
                    }
                    Route::Run(StageId::Validator) => validate(&mut s, false),
                    Route::Run(StageId::Documenter) => panic!("documenter after failures"),
                    Route::Fail(_) => break,
                    other => panic!("unexpected route {:?}", other),
                }
            }
            assert_eq!(generator_runs, max);
            assert_eq!(s.retry_count(), max);
        }
    }

    #[test]
    fn test_never_revisits_extractor_or_mapper() {
        let mut s = state(3);
        let mut seen = Vec::new();
        let mut verdicts = vec![false, false, true].into_iter();
        loop {
            let route = next(&s);
            match &route {
                Route::Run(StageId::Extractor) => s.apply(schema()).unwrap(),
                Route::Run(StageId::Mapper) => s.apply(mapping()).unwrap(),
                Route::Run(StageId::Generator) => generate(&mut s),
                Route::Run(StageId::Validator) => validate(&mut s, verdicts.next().unwrap()),
                Route::Run(StageId::Documenter) => s.apply(docs()).unwrap(),
                Route::Complete => break,
                other => panic!("unexpected route {:?}", other),
            }
            if let Route::Run(stage) = route {
                seen.push(stage);
            }
        }
        assert_eq!(seen.iter().filter(|s| **s == StageId::Extractor).count(), 1);
        assert_eq!(seen.iter().filter(|s| **s == StageId::Mapper).count(), 1);
        assert_eq!(seen.iter().filter(|s| **s == StageId::Generator).count(), 3);
        assert_eq!(seen.iter().filter(|s| **s == StageId::Documenter).count(), 1);
        assert_eq!(s.retry_count(), 2);
    }

    #[test]
    fn test_terminal_halts() {
        let mut s = state(3);
        s.fail(ErrorRecord::new(None, "cancelled", "client left"))
            .unwrap();
        assert_eq!(next(&s), Route::Halt);
    }
}
