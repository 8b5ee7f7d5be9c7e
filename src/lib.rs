//! # mobibot-pipeline
//!
//! A resumable, stage-based execution engine for long-running document jobs
//! (videos, PDFs, articles) whose steps call slow, failure-prone external
//! services.
//!
//! ## Why this crate?
//!
//! A job that downloads a video, transcribes it on a GPU container and
//! translates the transcript can take hours, and any step can fail. Rather
//! than transactions, the engine relies on idempotency: every stage declares
//! the document fields it produces, a stage whose outputs are already set is
//! skipped, and every run ends by writing a checkpoint. Re-running a job, or
//! restarting it from any stage, only redoes the work that is missing.
//!
//! ## Engine Overview
//!
//! ```text
//! Document
//!  │
//!  ├─ for each enabled stage, in declaration order
//!  │    ├─ skip      outputs already set?
//!  │    ├─ gather    deep copies of the declared inputs
//!  │    ├─ resources acquire services (containers / external URLs)
//!  │    ├─ call      stage function, errors and panics contained
//!  │    ├─ release   services in reverse order
//!  │    └─ bind      results → declared outputs, timing recorded
//!  └─ checkpoint     data/pipeline_state_<kind>_<uuid>.json
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mobibot_pipeline::{fold, Document, EngineConfig, ExecutionTimes, Pipeline, Stage, StageOutput};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Job {
//!     id: String,
//!     a: Option<i64>,
//!     b: Option<i64>,
//!     #[serde(default)]
//!     execution_times: ExecutionTimes,
//! }
//!
//! impl Document for Job {
//!     const KIND: &'static str = "Job";
//!     const IDENTITY: &'static [&'static str] = &["id"];
//!     fn execution_times(&self) -> &ExecutionTimes { &self.execution_times }
//!     fn execution_times_mut(&mut self) -> &mut ExecutionTimes { &mut self.execution_times }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::<Job>::new([
//!         Stage::sync(|_, _| Ok(StageOutput::single(5))).named("seed").outputs(["a"]),
//!         Stage::sync(|inputs, _| Ok(StageOutput::single(inputs.arg::<i64>(0)? * 2)))
//!             .named("double")
//!             .inputs(["a"])
//!             .outputs(["b"]),
//!     ])?;
//!
//!     let job = Job { id: "x".into(), ..Default::default() };
//!     let run = fold(&pipeline, job, &EngineConfig::default()).await?;
//!     assert_eq!(run.document.b, Some(10));
//!     eprintln!("checkpoint: {}", run.checkpoint.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mobibot` checkpoint inspector (clap + anyhow + tracing-subscriber + chrono) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mobibot-pipeline = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use config::{EngineConfig, EngineConfigBuilder, RestartPoint};
pub use document::{query, Document, DocumentState, ExecutionTimes, Query};
pub use error::{BoxError, FallbackError, InputError, PipelineError, ServiceError, StageError};
pub use output::{PipelineRun, RunReport};
pub use pipeline::fallback::{one_of, one_of_validated, Candidate};
pub use pipeline::fold::fold;
pub use pipeline::resource::{
    run_with_resources, ResourceDescriptor, ScopeError, ServiceContext, ServiceHandle,
};
pub use pipeline::restart::{restart, run_or_resume};
pub use pipeline::stage::{FailurePolicy, Pipeline, Stage, StageInputs, StageOutput, StageResult};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use service::{ContainerService, ExternalService, ServiceConfig};
