//! Pipeline orchestrator.
//!
//! Drives one job from a pending state to `completed` or `failed`:
//!
//! 1. Prepare the source once with the [`ContextManager`]
//! 2. Ask the [router](super::router) for the next step
//! 3. Run the chosen stage under the stage timeout and the job's
//!    cancellation token
//! 4. Commit the stage output in one step, or record the failure and stop
//!
//! Stage failures (backend errors, timeouts, cancellation, malformed
//! responses) are fatal. Only a failed validation loops back, and only
//! through the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::error::StageError;
use crate::agents::{DocumenterAgent, ExtractorAgent, GeneratorAgent, MapperAgent, ValidatorAgent};
use crate::context::{ContextManager, PreparedContext};
use crate::llm::InferenceBackend;

use super::config::{ConfigError, PipelineConfig};
use super::events::{EventKind, ProgressSink, StageStatus};
use super::router::{self, Route, RETRY_BUDGET_EXHAUSTED};
use super::stage::{Stage, StageId, StageReport};
use super::state::{ErrorRecord, PipelineState, SourceDocument};

/// Runs jobs through the five stages.
///
/// One orchestrator can run many jobs concurrently; each run owns its own
/// `PipelineState`.
pub struct Orchestrator {
    config: PipelineConfig,
    context: ContextManager,
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.stages.keys().collect();
        stages.sort();
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("stages", &stages)
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator whose stages share `backend`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` is invalid.
    pub fn new(
        config: PipelineConfig,
        context: ContextManager,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let generation = config.generation.clone();
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(ExtractorAgent::new(backend.clone(), generation.clone())),
            Arc::new(MapperAgent::new(config.target_language.clone())),
            Arc::new(GeneratorAgent::new(
                backend.clone(),
                generation.clone(),
                config.target_language.clone(),
            )),
            Arc::new(ValidatorAgent::new(backend.clone(), generation.clone())),
            Arc::new(DocumenterAgent::new(backend, generation)),
        ];

        Ok(Self {
            config,
            context,
            stages: stages.into_iter().map(|s| (s.id(), s)).collect(),
        })
    }

    /// Replaces the stage with the same id.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context_manager(&self) -> &ContextManager {
        &self.context
    }

    /// Runs one job to a terminal state and returns it.
    pub async fn run(
        &self,
        job_id: Uuid,
        source: SourceDocument,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineState {
        let mut state = PipelineState::new(job_id, source, self.config.max_retries);

        for stage in StageId::ALL {
            sink.stage(stage, StageStatus::Pending, None, 0.0).await;
        }

        if let Err(e) = state.start() {
            error!(job_id = %job_id, error = %e, "Could not start pipeline");
            return state;
        }

        info!(
            job_id = %job_id,
            file = %state.source().file_name,
            language = %state.source().language,
            max_retries = self.config.max_retries,
            "Pipeline started"
        );

        let prepared = match self.context.prepare(&state.source().text) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Context preparation failed");
                let record = ErrorRecord::new(None, "context", e.to_string());
                self.finish_failed(&mut state, record, sink).await;
                return state;
            }
        };

        for warning in prepared.warnings() {
            warn!(job_id = %job_id, warning = %warning, "Context warning");
        }
        if let Err(e) = state.record_context(prepared.strategy(), prepared.warnings()) {
            let record = ErrorRecord::new(None, "internal", e.to_string());
            self.finish_failed(&mut state, record, sink).await;
            return state;
        }

        loop {
            match router::next(&state) {
                Route::Run(stage) => {
                    if !self
                        .run_stage(stage, &mut state, &prepared, sink, cancel)
                        .await
                    {
                        break;
                    }
                }
                Route::Complete => {
                    self.finish_completed(&mut state, sink).await;
                    break;
                }
                Route::Fail(reason) => {
                    warn!(
                        job_id = %job_id,
                        retry_count = state.retry_count(),
                        "Retry budget exhausted"
                    );
                    let record =
                        ErrorRecord::new(Some(StageId::Validator), RETRY_BUDGET_EXHAUSTED, reason);
                    self.finish_failed(&mut state, record, sink).await;
                    break;
                }
                Route::Halt => break,
            }
        }

        state
    }

    /// Runs one stage and commits its output. Returns `false` if the job
    /// has stopped.
    async fn run_stage(
        &self,
        stage_id: StageId,
        state: &mut PipelineState,
        prepared: &PreparedContext,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> bool {
        let job_id = state.job_id();
        let progress_before = (stage_id.position() - 1) as f32 / StageId::ALL.len() as f32;

        let Some(stage) = self.stages.get(&stage_id).cloned() else {
            let err = StageError::Internal {
                stage: stage_id,
                message: "no stage registered".to_string(),
            };
            self.fail_stage(state, err, progress_before, sink).await;
            return false;
        };

        let running_message = (stage_id == StageId::Generator && state.retry_count() > 0)
            .then(|| format!("attempt {} after failed validation", state.next_attempt()));
        info!(
            job_id = %job_id,
            stage = %stage_id,
            retry_count = state.retry_count(),
            "Stage started"
        );
        sink.stage(stage_id, StageStatus::Running, running_message, progress_before)
            .await;

        let started = Instant::now();
        let timeout = self.config.stage_timeout;
        let outcome = {
            let run = stage.run(&*state, prepared);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StageError::Cancelled { stage: stage_id }),
                result = tokio::time::timeout(timeout, run) => match result {
                    Ok(result) => result,
                    Err(_) => Err(StageError::Timeout { stage: stage_id, timeout }),
                },
            }
        };

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                self.fail_stage(state, err, progress_before, sink).await;
                return false;
            }
        };

        let StageReport {
            output,
            message,
            warnings,
        } = report;

        if output.stage() != stage_id {
            let err = StageError::Internal {
                stage: stage_id,
                message: format!("returned output of stage {}", output.stage()),
            };
            self.fail_stage(state, err, progress_before, sink).await;
            return false;
        }

        if let Err(source) = state.apply(output) {
            let err = StageError::State {
                stage: stage_id,
                source,
            };
            self.fail_stage(state, err, progress_before, sink).await;
            return false;
        }

        for warning in warnings {
            warn!(job_id = %job_id, stage = %stage_id, warning = %warning, "Stage warning");
            if let Err(e) = state.add_warning(format!("{}: {}", stage_id, warning)) {
                debug!(error = %e, "Dropped stage warning");
            }
        }

        info!(
            job_id = %job_id,
            stage = %stage_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = %message,
            "Stage completed"
        );
        sink.stage(
            stage_id,
            StageStatus::Completed,
            Some(message),
            stage_id.progress(),
        )
        .await;
        true
    }

    async fn fail_stage(
        &self,
        state: &mut PipelineState,
        err: StageError,
        progress: f32,
        sink: &ProgressSink,
    ) {
        error!(
            job_id = %state.job_id(),
            stage = %err.stage(),
            category = %err.category(),
            error = %err,
            "Stage failed"
        );
        sink.stage(
            err.stage(),
            StageStatus::Failed,
            Some(err.to_string()),
            progress,
        )
        .await;
        self.finish_failed(state, ErrorRecord::from(&err), sink)
            .await;
    }

    async fn finish_failed(
        &self,
        state: &mut PipelineState,
        record: ErrorRecord,
        sink: &ProgressSink,
    ) {
        sink.emit(EventKind::Error {
            stage: record.stage,
            category: record.category.clone(),
            message: record.message.clone(),
        })
        .await;

        if let Err(e) = state.fail(record) {
            warn!(job_id = %state.job_id(), error = %e, "Failure not recorded");
        }
        info!(
            job_id = %state.job_id(),
            retry_count = state.retry_count(),
            "Pipeline failed"
        );
        sink.emit(EventKind::Finished {
            status: state.status(),
        })
        .await;
    }

    async fn finish_completed(&self, state: &mut PipelineState, sink: &ProgressSink) {
        if let Err(e) = state.complete() {
            warn!(job_id = %state.job_id(), error = %e, "Completion not recorded");
        }

        if let Some(artifact) = state.generated_artifact() {
            sink.emit(EventKind::Artifact {
                file_name: artifact.file_name.clone(),
                code: artifact.code.clone(),
                attempt: artifact.attempt,
            })
            .await;
        }

        info!(
            job_id = %state.job_id(),
            retry_count = state.retry_count(),
            "Pipeline completed"
        );
        sink.emit(EventKind::Finished {
            status: state.status(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::agents::error::{FailureCategory, StageResult};
    use crate::context::ContextConfig;
    use crate::llm::{MockBackend, MockFailure};
    use crate::pipeline::stage::StageOutput;
    use crate::pipeline::state::{PipelineStatus, SourceLanguage};
    use crate::pipeline::events::ProgressEvent;

    const SOURCE: &str = r#"#include <cstdio>

class Counter {
public:
    Counter() : value(0) {}
    void add(int n) { value += n; }
    int get() const { return value; }
private:
    int value;
};

int main() {
    Counter* c = new Counter();
    for (int i = 0; i < 10; ++i) {
        c->add(i);
    }
    printf("%d\n", c->get());
    delete c;
    return 0;
}
"#;

    fn orchestrator(backend: Arc<MockBackend>, config: PipelineConfig) -> Orchestrator {
        let context = ContextManager::new(ContextConfig::default()).unwrap();
        Orchestrator::new(config, context, backend).unwrap()
    }

    fn source() -> SourceDocument {
        SourceDocument::new(SOURCE, SourceLanguage::Cpp, "counter.cpp")
    }

    async fn run(orchestrator: &Orchestrator) -> (PipelineState, Vec<ProgressEvent>) {
        let (sink, mut rx) = ProgressSink::channel(Uuid::new_v4(), 256);
        let state = orchestrator
            .run(sink.job_id(), source(), &sink, &CancellationToken::new())
            .await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (state, events)
    }

    /// Counts calls, then delegates to an inner stage.
    struct CountingStage {
        inner: Arc<dyn Stage>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Stage for CountingStage {
        fn id(&self) -> StageId {
            self.inner.id()
        }

        async fn run(
            &self,
            state: &PipelineState,
            context: &PreparedContext,
        ) -> StageResult<StageReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.run(state, context).await
        }
    }

    /// Returns output belonging to a different stage.
    struct ConfusedStage;

    #[async_trait]
    impl Stage for ConfusedStage {
        fn id(&self) -> StageId {
            StageId::Mapper
        }

        async fn run(
            &self,
            _state: &PipelineState,
            _context: &PreparedContext,
        ) -> StageResult<StageReport> {
            Ok(StageReport::new(
                StageOutput::Documentation(crate::pipeline::state::Documentation {
                    markdown: String::new(),
                    narrative: String::new(),
                    diagram: String::new(),
                }),
                "wrong",
            ))
        }
    }

    /// Re-emits a schema with a warning attached.
    struct RepeatExtractor;

    #[async_trait]
    impl Stage for RepeatExtractor {
        fn id(&self) -> StageId {
            StageId::Extractor
        }

        async fn run(
            &self,
            _state: &PipelineState,
            _context: &PreparedContext,
        ) -> StageResult<StageReport> {
            Ok(StageReport::new(
                StageOutput::Schema(crate::pipeline::state::LogicSchema::default()),
                "again",
            )
            .with_warnings(vec!["partial parse".to_string()]))
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let backend = Arc::new(MockBackend::new());
        let orchestrator = orchestrator(backend.clone(), PipelineConfig::default());
        let (state, events) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Completed);
        assert_eq!(state.retry_count(), 0);
        assert!(state.documentation().is_some());
        assert!(state.errors().is_empty());
        assert_eq!(backend.calls(StageId::Generator), 1);
        assert_eq!(backend.calls(StageId::Mapper), 0);

        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..events.len() as u64).collect::<Vec<_>>());
        assert!(events.last().unwrap().is_final());
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Artifact { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn test_retry_then_pass() {
        let backend = Arc::new(MockBackend::new().with_verdicts([false, true]));
        let orchestrator = orchestrator(backend.clone(), PipelineConfig::default());
        let (state, _) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Completed);
        assert_eq!(state.retry_count(), 1);
        assert_eq!(state.validation_history().len(), 2);
        let artifact = state.generated_artifact().unwrap();
        assert_eq!(artifact.attempt, 2);
        assert!(!artifact.addressed_failures.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_is_fatal() {
        let backend =
            Arc::new(MockBackend::new().with_failure(StageId::Extractor, MockFailure::Unavailable));
        let orchestrator = orchestrator(backend.clone(), PipelineConfig::default());
        let (state, events) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Failed);
        let failure = state.failure().unwrap();
        assert_eq!(failure.stage, Some(StageId::Extractor));
        assert_eq!(failure.category, FailureCategory::BackendUnavailable.as_str());
        assert!(state.logic_schema().is_none());
        assert_eq!(backend.calls(StageId::Generator), 0);
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Error { .. })));
    }

    #[tokio::test]
    async fn test_stage_timeout_is_fatal() {
        let backend = Arc::new(MockBackend::new().with_failure(StageId::Validator, MockFailure::Hang));
        let config = PipelineConfig::default().with_stage_timeout(Duration::from_millis(50));
        let orchestrator = orchestrator(backend, config);
        let (state, _) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Failed);
        let failure = state.failure().unwrap();
        assert_eq!(failure.stage, Some(StageId::Validator));
        assert_eq!(failure.category, "timeout");
        assert!(state.validation_result().is_none());
        assert_eq!(state.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = Arc::new(MockBackend::new());
        let orchestrator = orchestrator(backend.clone(), PipelineConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sink = ProgressSink::disabled(Uuid::new_v4());
        let state = orchestrator
            .run(sink.job_id(), source(), &sink, &cancel)
            .await;

        assert_eq!(state.status(), PipelineStatus::Failed);
        assert_eq!(state.failure().unwrap().category, "cancelled");
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_mapper_runs_once_across_retries() {
        let backend = Arc::new(MockBackend::new().with_verdicts([false, false, true]));
        let counting = Arc::new(CountingStage {
            inner: Arc::new(MapperAgent::new("python")),
            calls: AtomicUsize::new(0),
        });
        let orchestrator =
            orchestrator(backend, PipelineConfig::default()).with_stage(counting.clone());
        let (state, _) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Completed);
        assert_eq!(state.retry_count(), 2);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mismatched_output_rejected() {
        let backend = Arc::new(MockBackend::new());
        let orchestrator =
            orchestrator(backend, PipelineConfig::default()).with_stage(Arc::new(ConfusedStage));
        let (state, _) = run(&orchestrator).await;

        assert_eq!(state.status(), PipelineStatus::Failed);
        assert_eq!(state.failure().unwrap().category, "internal");
        assert!(state.design_mapping().is_none());
    }

    #[tokio::test]
    async fn test_rejected_output_leaves_no_warnings() {
        let backend = Arc::new(MockBackend::new());
        let orchestrator = orchestrator(backend, PipelineConfig::default())
            .with_stage(Arc::new(RepeatExtractor));

        let mut state = PipelineState::new(Uuid::new_v4(), source(), 3);
        state.start().unwrap();
        state
            .apply(StageOutput::Schema(crate::pipeline::state::LogicSchema::default()))
            .unwrap();
        let prepared = orchestrator.context_manager().prepare(SOURCE).unwrap();
        let sink = ProgressSink::disabled(state.job_id());

        let committed = orchestrator
            .run_stage(
                StageId::Extractor,
                &mut state,
                &prepared,
                &sink,
                &CancellationToken::new(),
            )
            .await;

        assert!(!committed);
        assert_eq!(state.status(), PipelineStatus::Failed);
        assert!(
            state.warnings().iter().all(|w| !w.contains("partial parse")),
            "{:?}",
            state.warnings()
        );
    }
}
