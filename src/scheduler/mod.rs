//! Asynchronous job submission.
//!
//! - **JobRequest**: a submission, validated before any state exists
//! - **JobScheduler**: starts jobs in the background and tracks them
//! - **JobSnapshot**: latest status of a job, folded from its progress events
//!
//! # Example
//!
//! ```rust,ignore
//! use legacy_forge::context::ContextConfig;
//! use legacy_forge::llm::MockBackend;
//! use legacy_forge::pipeline::PipelineConfig;
//! use legacy_forge::scheduler::{JobMode, JobRequest, JobScheduler};
//! use std::sync::Arc;
//!
//! let scheduler = JobScheduler::new(
//!     PipelineConfig::from_env()?,
//!     ContextConfig::from_env()?,
//!     Arc::new(MockBackend::new()),
//! )?;
//!
//! let id = scheduler.submit(JobRequest::new(text, "cpp", "engine.cpp", JobMode::Mock))?;
//! let mut progress = scheduler.take_progress(id)?;
//! while let Some(event) = progress.recv().await {
//!     println!("{:?}", event.kind);
//! }
//! let state = scheduler.wait(id).await?;
//! ```

pub mod job;
pub mod registry;

pub use job::{JobMode, JobRequest, JobSnapshot};
pub use registry::{JobScheduler, SchedulerError, SchedulerStats};
