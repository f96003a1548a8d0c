//! Job registry: asynchronous submission and tracking of pipeline jobs.
//!
//! Each job runs its own orchestrator loop on the tokio runtime and owns a
//! private `PipelineState`. The backend behind each mode is wrapped once in
//! a `SerializedBackend`, so concurrent jobs queue FIFO for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{ContextConfig, ContextManager};
use crate::llm::{InferenceBackend, SerializedBackend};
use crate::pipeline::{
    ConfigError, Orchestrator, PipelineConfig, PipelineState, PipelineStatus, ProgressEvent,
    ProgressSink,
};

use super::job::{JobMode, JobRequest, JobSnapshot};

/// Errors from the job registry.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The submission was rejected before any job state existed.
    #[error("Job rejected: {0}")]
    Rejected(#[from] ConfigError),

    /// No backend is configured for the requested mode.
    #[error("No backend configured for mode '{0}'")]
    ModeUnavailable(JobMode),

    /// No job with this id.
    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    /// The progress stream of this job was already taken.
    #[error("Progress stream for job {0} already taken")]
    ProgressTaken(Uuid),

    /// The job has not reached a terminal state yet.
    #[error("Job {0} is still running")]
    StillRunning(Uuid),

    /// The job task ended without publishing a final state.
    #[error("Job {0} aborted before finishing")]
    JobAborted(Uuid),

    /// Submission happened outside a tokio runtime.
    #[error("No tokio runtime available to run the job")]
    NoRuntime,

    /// A registry lock was poisoned by a panicking thread.
    #[error("Job registry lock poisoned")]
    Poisoned,
}

/// Counters across all jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Average wall time of finished jobs.
    pub average_job_duration: Duration,
}

impl SchedulerStats {
    pub fn running(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct SharedStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn record_finish(&self, status: PipelineStatus, duration: Duration) {
        match status {
            PipelineStatus::Completed => self.completed.fetch_add(1, Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self) -> SchedulerStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let finished = completed + failed;
        let average_job_duration = if finished > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / finished)
        } else {
            Duration::ZERO
        };
        SchedulerStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed,
            failed,
            average_job_duration,
        }
    }
}

type FinalState = Option<Arc<PipelineState>>;

struct JobEntry {
    snapshot: Arc<Mutex<JobSnapshot>>,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    done: watch::Receiver<FinalState>,
}

/// Accepts jobs and runs them in the background.
pub struct JobScheduler {
    mock: Arc<Orchestrator>,
    real: Option<Arc<Orchestrator>>,
    event_buffer: usize,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    stats: Arc<SharedStats>,
}

impl JobScheduler {
    /// Creates a scheduler whose `mock` jobs run against `mock_backend`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if either configuration is invalid.
    pub fn new(
        config: PipelineConfig,
        context: ContextConfig,
        mock_backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, ConfigError> {
        let mock = build_orchestrator(&config, &context, mock_backend)?;
        Ok(Self {
            event_buffer: config.event_buffer,
            mock: Arc::new(mock),
            real: None,
            jobs: RwLock::new(HashMap::new()),
            stats: Arc::new(SharedStats::default()),
        })
    }

    /// Enables `real` jobs against `backend`.
    pub fn with_real_backend(
        mut self,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, ConfigError> {
        let config = self.mock.config().clone();
        let context = self.mock.context_manager().config().clone();
        self.real = Some(Arc::new(build_orchestrator(&config, &context, backend)?));
        Ok(self)
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, JobEntry>>, SchedulerError> {
        self.jobs.read().map_err(|_| SchedulerError::Poisoned)
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, JobEntry>>, SchedulerError> {
        self.jobs.write().map_err(|_| SchedulerError::Poisoned)
    }

    /// Validates `request`, starts the job and returns its id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<Uuid, SchedulerError> {
        let (source, mode) = request.validate()?;
        let orchestrator = match mode {
            JobMode::Mock => Arc::clone(&self.mock),
            JobMode::Real => self
                .real
                .clone()
                .ok_or(SchedulerError::ModeUnavailable(mode))?,
        };
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let job_id = Uuid::new_v4();
        let snapshot = Arc::new(Mutex::new(JobSnapshot::new(job_id, mode, &source.file_name)));
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel::<FinalState>(None);

        self.write_jobs()?.insert(
            job_id,
            JobEntry {
                snapshot: Arc::clone(&snapshot),
                cancel: cancel.clone(),
                progress: Some(out_rx),
                done: done_rx,
            },
        );
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        info!(job_id = %job_id, mode = %mode, file = %source.file_name, "Job submitted");

        let (sink, mut events) = ProgressSink::channel(job_id, self.event_buffer);
        let stats = Arc::clone(&self.stats);

        runtime.spawn(async move {
            let started = Instant::now();

            let forward = async move {
                while let Some(event) = events.recv().await {
                    if let Ok(mut snapshot) = snapshot.lock() {
                        snapshot.observe(&event);
                    }
                    // Ignore send errors (nobody is listening)
                    let _ = out_tx.send(event);
                }
            };
            let run = async move {
                let state = orchestrator.run(job_id, source, &sink, &cancel).await;
                drop(sink);
                state
            };

            let (state, ()) = tokio::join!(run, forward);
            let status = state.status();
            stats.record_finish(status, started.elapsed());
            info!(
                job_id = %job_id,
                status = %status,
                retry_count = state.retry_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job finished"
            );
            if done_tx.send(Some(Arc::new(state))).is_err() {
                warn!(job_id = %job_id, "Job finished after registry dropped");
            }
        });

        Ok(job_id)
    }

    /// Latest snapshot of a job.
    pub fn status(&self, job_id: Uuid) -> Result<JobSnapshot, SchedulerError> {
        let jobs = self.read_jobs()?;
        let entry = jobs.get(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        let snapshot = entry.snapshot.lock().map_err(|_| SchedulerError::Poisoned)?;
        Ok(snapshot.clone())
    }

    /// Snapshots of every known job.
    pub fn list(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        let jobs = self.read_jobs()?;
        let mut snapshots = jobs
            .values()
            .filter_map(|entry| entry.snapshot.lock().ok().map(|s| s.clone()))
            .collect::<Vec<_>>();
        snapshots.sort_by_key(|s| s.submitted_at);
        Ok(snapshots)
    }

    /// Requests cancellation. The job ends `failed` with a `cancelled` error.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let jobs = self.read_jobs()?;
        let entry = jobs.get(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        info!(job_id = %job_id, "Cancelling job");
        entry.cancel.cancel();
        Ok(())
    }

    /// Takes the ordered progress stream of a job. Only one consumer.
    pub fn take_progress(
        &self,
        job_id: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<ProgressEvent>, SchedulerError> {
        let mut jobs = self.write_jobs()?;
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::UnknownJob(job_id))?;
        entry
            .progress
            .take()
            .ok_or(SchedulerError::ProgressTaken(job_id))
    }

    /// Waits for a job to reach a terminal state and returns it.
    pub async fn wait(&self, job_id: Uuid) -> Result<Arc<PipelineState>, SchedulerError> {
        let mut done = {
            let jobs = self.read_jobs()?;
            jobs.get(&job_id)
                .ok_or(SchedulerError::UnknownJob(job_id))?
                .done
                .clone()
        };

        let result = done.wait_for(|state| state.is_some()).await;
        match result {
            Ok(state) => state.clone().ok_or(SchedulerError::JobAborted(job_id)),
            Err(_) => {
                error!(job_id = %job_id, "Job task ended without a final state");
                Err(SchedulerError::JobAborted(job_id))
            }
        }
    }

    /// Forgets a finished job and returns its final state.
    ///
    /// Drops the job's snapshot and any progress events nobody took.
    pub fn remove(&self, job_id: Uuid) -> Result<Arc<PipelineState>, SchedulerError> {
        let mut jobs = self.write_jobs()?;
        let entry = jobs.get(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        let state = entry
            .done
            .borrow()
            .clone()
            .ok_or(SchedulerError::StillRunning(job_id))?;
        jobs.remove(&job_id);
        debug!(job_id = %job_id, "Job removed from registry");
        Ok(state)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    context: &ContextConfig,
    backend: Arc<dyn InferenceBackend>,
) -> Result<Orchestrator, ConfigError> {
    let serialized: Arc<dyn InferenceBackend> =
        Arc::new(SerializedBackend::new(backend, config.backend_slots));
    Orchestrator::new(config.clone(), ContextManager::new(context.clone())?, serialized)
}
