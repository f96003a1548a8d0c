//! Job definitions for the scheduler.
//!
//! - `JobRequest`: what a client submits
//! - `JobMode`: which inference backend the job runs against
//! - `JobSnapshot`: latest observed status of a running job

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{
    ConfigError, EventKind, PipelineStatus, ProgressEvent, SourceDocument, SourceLanguage,
    StageId, StageStatus,
};

/// Inference backend a job runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Deterministic stub backend.
    #[default]
    Mock,
    /// The configured model.
    Real,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Mock => "mock",
            JobMode::Real => "real",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(JobMode::Mock),
            "real" => Ok(JobMode::Real),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// A job submission.
///
/// Fields are kept as submitted; [`JobRequest::validate`] rejects bad ones
/// before any pipeline state exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source_text: String,
    /// `cpp` or `java`. Empty means infer from `file_name`.
    #[serde(default)]
    pub source_language: String,
    pub file_name: String,
    /// `mock` or `real`. Empty means `mock`.
    #[serde(default)]
    pub mode: String,
}

impl JobRequest {
    pub fn new(
        source_text: impl Into<String>,
        source_language: impl Into<String>,
        file_name: impl Into<String>,
        mode: JobMode,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            source_language: source_language.into(),
            file_name: file_name.into(),
            mode: mode.as_str().to_string(),
        }
    }

    /// Checks the submission and returns the document and mode to run.
    pub fn validate(&self) -> Result<(SourceDocument, JobMode), ConfigError> {
        if self.source_text.trim().is_empty() {
            return Err(ConfigError::MissingField("source_text"));
        }
        let file_name = self.file_name.trim();
        if file_name.is_empty() {
            return Err(ConfigError::MissingField("file_name"));
        }

        let language = if self.source_language.trim().is_empty() {
            SourceLanguage::from_file_name(file_name)
                .ok_or(ConfigError::MissingField("source_language"))?
        } else {
            self.source_language.parse::<SourceLanguage>()?
        };

        let mode = if self.mode.trim().is_empty() {
            JobMode::default()
        } else {
            self.mode.parse::<JobMode>()?
        };

        Ok((
            SourceDocument::new(self.source_text.clone(), language, file_name),
            mode,
        ))
    }
}

/// Latest observed status of a job, folded from its progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub mode: JobMode,
    pub file_name: String,
    pub status: PipelineStatus,
    pub current_stage: Option<StageId>,
    pub stage_status: Option<StageStatus>,
    /// Fraction of the pipeline done, in `[0, 1]`.
    pub progress: f32,
    /// Generator runs seen so far.
    pub attempts: u32,
    pub events_seen: u64,
    pub failure: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn new(job_id: Uuid, mode: JobMode, file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            mode,
            file_name: file_name.into(),
            status: PipelineStatus::Pending,
            current_stage: None,
            stage_status: None,
            progress: 0.0,
            attempts: 0,
            events_seen: 0,
            failure: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Folds one progress event into the snapshot.
    pub fn observe(&mut self, event: &ProgressEvent) {
        self.events_seen += 1;
        self.updated_at = event.timestamp;

        match &event.kind {
            EventKind::Stage {
                stage,
                status,
                progress,
                ..
            } => {
                // Initial pending announcements do not move the job.
                if *status == StageStatus::Pending {
                    return;
                }
                if self.status == PipelineStatus::Pending {
                    self.status = PipelineStatus::Running;
                }
                if *stage == StageId::Generator && *status == StageStatus::Running {
                    self.attempts += 1;
                }
                self.current_stage = Some(*stage);
                self.stage_status = Some(*status);
                self.progress = *progress;
            }
            EventKind::Artifact { .. } => {}
            EventKind::Error {
                category, message, ..
            } => {
                self.failure = Some(format!("{}: {}", category, message));
            }
            EventKind::Finished { status } => {
                self.status = *status;
                if *status == PipelineStatus::Completed {
                    self.progress = 1.0;
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64, kind: EventKind) -> ProgressEvent {
        ProgressEvent {
            job_id: Uuid::nil(),
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    fn stage(stage: StageId, status: StageStatus, progress: f32) -> EventKind {
        EventKind::Stage {
            stage,
            status,
            message: None,
            progress,
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Mock".parse::<JobMode>().unwrap(), JobMode::Mock);
        assert_eq!(" real ".parse::<JobMode>().unwrap(), JobMode::Real);
        assert!(matches!(
            "gpu".parse::<JobMode>(),
            Err(ConfigError::UnknownMode(m)) if m == "gpu"
        ));
    }

    #[test]
    fn test_validate_accepts_and_infers() {
        let request = JobRequest {
            source_text: "class A {};".to_string(),
            file_name: "a.hpp".to_string(),
            ..Default::default()
        };
        let (document, mode) = request.validate().unwrap();
        assert_eq!(document.language, SourceLanguage::Cpp);
        assert_eq!(mode, JobMode::Mock);

        let request = JobRequest::new("class A {}", "java", "A.java", JobMode::Real);
        let (document, mode) = request.validate().unwrap();
        assert_eq!(document.language, SourceLanguage::Java);
        assert_eq!(mode, JobMode::Real);
    }

    #[test]
    fn test_validate_rejects() {
        let blank = JobRequest::new("   ", "cpp", "a.cpp", JobMode::Mock);
        assert!(matches!(blank.validate(), Err(ConfigError::MissingField("source_text"))));

        let nameless = JobRequest::new("int x;", "cpp", "", JobMode::Mock);
        assert!(matches!(nameless.validate(), Err(ConfigError::MissingField("file_name"))));

        let rust = JobRequest::new("fn main() {}", "rust", "main.rs", JobMode::Mock);
        assert!(matches!(rust.validate(), Err(ConfigError::UnsupportedLanguage(_))));

        let unknown_ext = JobRequest::new("x", "", "notes.txt", JobMode::Mock);
        assert!(matches!(
            unknown_ext.validate(),
            Err(ConfigError::MissingField("source_language"))
        ));

        let mut bad_mode = JobRequest::new("int x;", "cpp", "a.cpp", JobMode::Mock);
        bad_mode.mode = "turbo".to_string();
        assert!(matches!(bad_mode.validate(), Err(ConfigError::UnknownMode(_))));
    }

    #[test]
    fn test_snapshot_folds_events() {
        let mut snapshot = JobSnapshot::new(Uuid::nil(), JobMode::Mock, "a.cpp");

        snapshot.observe(&event(0, stage(StageId::Extractor, StageStatus::Pending, 0.0)));
        assert_eq!(snapshot.status, PipelineStatus::Pending);
        assert!(snapshot.current_stage.is_none());

        snapshot.observe(&event(1, stage(StageId::Generator, StageStatus::Running, 0.4)));
        snapshot.observe(&event(2, stage(StageId::Generator, StageStatus::Completed, 0.6)));
        snapshot.observe(&event(3, stage(StageId::Generator, StageStatus::Running, 0.4)));
        assert_eq!(snapshot.status, PipelineStatus::Running);
        assert_eq!(snapshot.current_stage, Some(StageId::Generator));
        assert_eq!(snapshot.attempts, 2);

        snapshot.observe(&event(
            4,
            EventKind::Error {
                stage: Some(StageId::Generator),
                category: "timeout".to_string(),
                message: "slow".to_string(),
            },
        ));
        snapshot.observe(&event(
            5,
            EventKind::Finished {
                status: PipelineStatus::Failed,
            },
        ));
        assert!(snapshot.is_finished());
        assert_eq!(snapshot.failure.as_deref(), Some("timeout: slow"));
        assert_eq!(snapshot.events_seen, 6);
    }
}
