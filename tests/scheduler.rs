//! Concurrent jobs through the scheduler.

use std::sync::Arc;
use std::time::Duration;

use legacy_forge::context::ContextConfig;
use legacy_forge::llm::{MockBackend, MockFailure};
use legacy_forge::pipeline::{EventKind, PipelineConfig, PipelineStatus, StageId};
use legacy_forge::scheduler::{JobMode, JobRequest, JobScheduler, SchedulerError};

const QUEUE_SOURCE: &str = r#"import java.util.ArrayList;

public class TaskQueue {
    private ArrayList<String> tasks = new ArrayList<>();

    public void push(String task) {
        tasks.add(task);
    }

    public String pop() {
        if (tasks.isEmpty()) {
            return null;
        }
        return tasks.remove(0);
    }

    public static void main(String[] args) {
        TaskQueue queue = new TaskQueue();
        queue.push("build");
        System.out.println(queue.pop());
    }
}
"#;

fn request(file_name: &str) -> JobRequest {
    JobRequest::new(QUEUE_SOURCE, "java", file_name, JobMode::Mock)
}

#[tokio::test]
async fn concurrent_jobs_share_one_backend_slot() {
    let backend = Arc::new(MockBackend::new().with_latency(Duration::from_millis(5)));
    let scheduler =
        JobScheduler::new(PipelineConfig::default(), ContextConfig::default(), backend.clone())
            .unwrap();

    let ids: Vec<_> = (0..4)
        .map(|i| scheduler.submit(request(&format!("TaskQueue{i}.java"))).unwrap())
        .collect();

    for id in &ids {
        let state = scheduler.wait(*id).await.unwrap();
        assert_eq!(state.status(), PipelineStatus::Completed);
        assert_eq!(state.job_id(), *id);
    }

    assert_eq!(backend.max_in_flight(), 1);
    // Extractor, Generator, Validator and Documenter call the backend once per job.
    assert_eq!(backend.total_calls(), 4 * 4);

    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(scheduler.list().unwrap().len(), 4);
}

#[tokio::test]
async fn wider_slots_allow_overlap() {
    let backend = Arc::new(MockBackend::new().with_latency(Duration::from_millis(20)));
    let scheduler = JobScheduler::new(
        PipelineConfig::default().with_backend_slots(3),
        ContextConfig::default(),
        backend.clone(),
    )
    .unwrap();

    let ids: Vec<_> = (0..3)
        .map(|i| scheduler.submit(request(&format!("Q{i}.java"))).unwrap())
        .collect();
    for id in ids {
        scheduler.wait(id).await.unwrap();
    }

    assert!(backend.max_in_flight() <= 3);
}

#[tokio::test]
async fn jobs_keep_separate_state() {
    // Verdicts are consumed in order across jobs, so run them one at a time.
    let backend = Arc::new(MockBackend::new().with_verdicts([false, true]));
    let scheduler =
        JobScheduler::new(PipelineConfig::default(), ContextConfig::default(), backend.clone())
            .unwrap();

    let first = scheduler.submit(request("First.java")).unwrap();
    let first_state = scheduler.wait(first).await.unwrap();
    let second = scheduler.submit(request("Second.java")).unwrap();
    let second_state = scheduler.wait(second).await.unwrap();

    assert_eq!(first_state.retry_count(), 1);
    assert_eq!(second_state.retry_count(), 0);
    assert_eq!(first_state.source().file_name, "First.java");
    assert_eq!(
        second_state.generated_artifact().unwrap().file_name,
        "second.py"
    );
    assert_eq!(scheduler.status(first).unwrap().attempts, 2);
    assert_eq!(scheduler.status(second).unwrap().attempts, 1);
}

#[tokio::test]
async fn stage_timeout_fails_job() {
    let backend =
        Arc::new(MockBackend::new().with_failure(StageId::Validator, MockFailure::Hang));
    let scheduler = JobScheduler::new(
        PipelineConfig::default().with_stage_timeout(Duration::from_millis(50)),
        ContextConfig::default(),
        backend,
    )
    .unwrap();

    let id = scheduler.submit(request("TaskQueue.java")).unwrap();
    let mut progress = scheduler.take_progress(id).unwrap();
    let state = scheduler.wait(id).await.unwrap();

    assert_eq!(state.status(), PipelineStatus::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.stage, Some(StageId::Validator));
    assert_eq!(failure.category, "timeout");
    assert!(state.generated_artifact().is_some());
    assert!(state.validation_result().is_none());

    let mut saw_error = false;
    while let Some(event) = progress.recv().await {
        if let EventKind::Error { category, .. } = &event.kind {
            assert_eq!(category, "timeout");
            saw_error = true;
        }
    }
    assert!(saw_error);

    let snapshot = scheduler.status(id).unwrap();
    assert!(snapshot.is_finished());
    assert_eq!(snapshot.failure.as_deref().map(|f| f.starts_with("timeout")), Some(true));
    assert_eq!(scheduler.stats().failed, 1);
}

#[tokio::test]
async fn cancelled_job_does_not_block_others() {
    let hanging =
        Arc::new(MockBackend::new().with_failure(StageId::Generator, MockFailure::Hang));
    let scheduler = JobScheduler::new(
        PipelineConfig::default().with_backend_slots(2),
        ContextConfig::default(),
        hanging,
    )
    .unwrap()
    .with_real_backend(Arc::new(MockBackend::new()))
    .unwrap();

    let stuck = scheduler.submit(request("Stuck.java")).unwrap();
    let healthy = scheduler
        .submit(JobRequest::new(QUEUE_SOURCE, "java", "Healthy.java", JobMode::Real))
        .unwrap();

    let healthy_state = scheduler.wait(healthy).await.unwrap();
    assert_eq!(healthy_state.status(), PipelineStatus::Completed);

    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.cancel(stuck).unwrap();
    let stuck_state = scheduler.wait(stuck).await.unwrap();
    assert_eq!(stuck_state.status(), PipelineStatus::Failed);
    assert_eq!(stuck_state.failure().unwrap().category, "cancelled");
    assert!(stuck_state.logic_schema().is_some());
    assert!(stuck_state.generated_artifact().is_none());
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let result = JobScheduler::new(
        PipelineConfig::default().with_target_language("cobol"),
        ContextConfig::default(),
        Arc::new(MockBackend::new()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn waiting_twice_returns_same_state() {
    let scheduler = JobScheduler::new(
        PipelineConfig::default(),
        ContextConfig::default(),
        Arc::new(MockBackend::new()),
    )
    .unwrap();
    let id = scheduler.submit(request("TaskQueue.java")).unwrap();

    let first = scheduler.wait(id).await.unwrap();
    let second = scheduler.wait(id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(matches!(
        scheduler.take_progress(id).map(|_| ()),
        Ok(())
    ));
    assert!(matches!(
        scheduler.take_progress(id),
        Err(SchedulerError::ProgressTaken(_))
    ));
}
