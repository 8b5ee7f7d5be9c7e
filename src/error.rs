//! Error types for the mobibot pipeline engine.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot proceed, or its result
//!   cannot be trusted (a stage declares a field the document does not have,
//!   a checkpoint is corrupt, a critical stage failed). Returned as
//!   `Err(PipelineError)` from [`crate::fold`], [`crate::restart`] and
//!   [`crate::run_or_resume`].
//!
//! * [`StageError`] — **Non-fatal**: a single stage failed (its function
//!   returned an error, a service could not be provisioned, it returned the
//!   wrong number of outputs). Stored inside [`crate::output::RunReport`];
//!   the stage's outputs stay unset and later stages still run.
//!
//! [`FallbackError`], [`ServiceError`] and [`InputError`] are raised inside
//! stage implementations and usually end up as the detail of a
//! [`StageError::Failed`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error returned by stage functions, service factories and fallback
/// candidates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All fatal errors returned by the pipeline engine.
///
/// Stage-level failures use [`StageError`] and are stored in
/// [`crate::output::RunReport`] rather than propagated here, unless the
/// stage was declared critical.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Declaration errors ────────────────────────────────────────────────
    /// A stage reads or writes a field the document type does not declare.
    #[error("Stage '{stage}' refers to unknown field '{field}' of document '{kind}'")]
    UnknownField {
        stage: String,
        field: String,
        kind: String,
    },

    /// A stage lists the same output field twice.
    #[error("Stage '{stage}' declares output '{field}' more than once")]
    DuplicateOutput { stage: String, field: String },

    /// A stage writes a field that is never unset: an identity field, or
    /// one whose default value is not `null` (such as the timings map).
    #[error("Stage '{stage}' cannot write '{field}': {reason}")]
    ReservedOutput {
        stage: String,
        field: String,
        reason: &'static str,
    },

    /// An identity field of the document type does not exist.
    #[error("Identity field '{field}' is not a field of document '{kind}'")]
    UnknownIdentityField { field: String, kind: String },

    /// The document does not serialise to a JSON object.
    #[error("Document '{kind}' must serialise to a JSON object with one key per field")]
    NotARecord { kind: String },

    // ── Restart errors ────────────────────────────────────────────────────
    /// The requested restart stage is not part of the pipeline.
    #[error("No stage named '{name}' in pipeline\nKnown stages: {}", .known.join(", "))]
    UnknownStage { name: String, known: Vec<String> },

    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// The checkpoint file does not exist.
    #[error("Checkpoint not found: '{path}'")]
    CheckpointNotFound { path: PathBuf },

    /// The checkpoint exists but cannot be parsed into a snapshot.
    #[error("Checkpoint '{path}' is corrupt: {detail}")]
    CorruptCheckpoint { path: PathBuf, detail: String },

    /// The checkpoint belongs to another document type.
    #[error("Checkpoint '{path}' does not hold a '{expected}' document")]
    CheckpointKindMismatch { path: PathBuf, expected: String },

    /// The checkpoint directory could not be created or listed.
    #[error("Cannot access checkpoint directory '{path}': {source}")]
    CheckpointDirUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write a checkpoint file.
    #[error("Failed to write checkpoint '{path}': {source}")]
    CheckpointWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Run errors ────────────────────────────────────────────────────────
    /// A stage declared critical failed; the run stopped after it.
    ///
    /// The partial document was still checkpointed to `checkpoint`.
    #[error("Critical stage '{stage}' failed: {source}\nPartial state saved to '{checkpoint}'")]
    CriticalStageFailed {
        stage: String,
        #[source]
        source: StageError,
        checkpoint: PathBuf,
    },

    /// Serialising or deserialising a document snapshot failed.
    #[error("Document snapshot failed: {0}")]
    Snapshot(#[source] serde_json::Error),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A non-fatal error for a single stage.
///
/// Stored in [`crate::output::RunReport::failed`] when a stage fails.
/// The run continues unless the stage is critical.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StageError {
    /// The stage function returned an error.
    #[error("Stage '{stage}' failed: {detail}")]
    Failed { stage: String, detail: String },

    /// The stage function panicked.
    #[error("Stage '{stage}' panicked: {detail}")]
    Panicked { stage: String, detail: String },

    /// A declared resource could not be acquired or set up.
    #[error("Stage '{stage}': resource '{resource}' unavailable: {detail}")]
    Resource {
        stage: String,
        resource: String,
        detail: String,
    },

    /// The function returned a different number of values than declared.
    #[error("Stage '{stage}' declares {declared} outputs but returned {returned}")]
    OutputArity {
        stage: String,
        declared: usize,
        returned: usize,
    },

    /// A tagged result did not name one of the declared outputs.
    #[error("Stage '{stage}' did not return declared output '{field}'")]
    MissingOutput { stage: String, field: String },

    /// A tagged result named a field the stage does not declare.
    #[error("Stage '{stage}' returned undeclared output '{field}'")]
    UnexpectedOutput { stage: String, field: String },

    /// An output value does not fit the document field's type.
    #[error("Stage '{stage}' returned a value the document cannot hold: {detail}")]
    OutputType { stage: String, detail: String },
}

impl StageError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &str {
        match self {
            StageError::Failed { stage, .. }
            | StageError::Panicked { stage, .. }
            | StageError::Resource { stage, .. }
            | StageError::OutputArity { stage, .. }
            | StageError::MissingOutput { stage, .. }
            | StageError::UnexpectedOutput { stage, .. }
            | StageError::OutputType { stage, .. } => stage,
        }
    }
}

/// Every candidate of a fallback chain failed.
///
/// The reported failure is always the **last** one observed, so callers
/// see the most proximate cause.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// The chain was called with no candidates.
    #[error("Fallback chain has no candidates")]
    NoCandidates,

    /// The last candidate raised an error.
    #[error("All {attempts} candidates failed; last was '{candidate}': {source}")]
    Exhausted {
        attempts: usize,
        candidate: String,
        #[source]
        source: BoxError,
    },

    /// The last candidate produced a result the validator rejected.
    #[error("All {attempts} candidates failed; result of '{candidate}' was rejected by validation")]
    Rejected { attempts: usize, candidate: String },
}

/// A stage could not decode one of its inputs.
#[derive(Debug, Error)]
pub enum InputError {
    /// Positional index beyond the declared inputs.
    #[error("Input #{index} requested but stage has {len} inputs")]
    OutOfRange { index: usize, len: usize },

    /// No declared input with this name.
    #[error("Input '{field}' is not declared by this stage")]
    Undeclared { field: String },

    /// The stored value does not deserialise into the requested type.
    #[error("Input '{field}' has unexpected shape: {source}")]
    Decode {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle failures of an external service used as a stage resource.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The `docker` binary could not be executed.
    #[error("Cannot run docker for service '{service}': {source}\nIs Docker installed and on PATH?")]
    DockerUnavailable {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// A docker command exited unsuccessfully.
    #[error("`{command}` failed for service '{service}': {stderr}")]
    CommandFailed {
        service: String,
        command: String,
        stderr: String,
    },

    /// The container started but never answered its readiness check.
    #[error("Service '{service}' not ready at {url} after {secs}s")]
    NotReady {
        service: String,
        url: String,
        secs: u64,
    },

    /// No host port could be determined for the container.
    #[error("Service '{service}' exposes no host port for container port {port}")]
    PortUnavailable { service: String, port: u16 },

    /// A stage asked for a service that no resource published.
    #[error("Service '{service}' was not provided to this stage\nDeclare it in the stage's resources.")]
    Missing { service: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_stage_lists_known_names() {
        let e = PipelineError::UnknownStage {
            name: "translte".into(),
            known: vec!["download".into(), "translate".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("translte"), "got: {msg}");
        assert!(msg.contains("download, translate"), "got: {msg}");
    }

    #[test]
    fn output_arity_display() {
        let e = StageError::OutputArity {
            stage: "split_video".into(),
            declared: 2,
            returned: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("2 outputs"), "got: {msg}");
        assert!(msg.contains("returned 3"), "got: {msg}");
    }

    #[test]
    fn stage_accessor_covers_variants() {
        let e = StageError::Resource {
            stage: "ocr".into(),
            resource: "ollama".into(),
            detail: "port busy".into(),
        };
        assert_eq!(e.stage(), "ocr");
        assert!(e.to_string().contains("ollama"));
    }

    #[test]
    fn critical_failure_exposes_stage_error_as_source() {
        use std::error::Error as _;
        let e = PipelineError::CriticalStageFailed {
            stage: "transcribe".into(),
            source: StageError::Failed {
                stage: "transcribe".into(),
                detail: "gpu lost".into(),
            },
            checkpoint: PathBuf::from("data/pipeline_state_video_x.json"),
        };
        let src = e.source().expect("source");
        assert!(src.to_string().contains("gpu lost"));
        assert!(e.to_string().contains("pipeline_state_video_x.json"));
    }

    #[test]
    fn exhausted_fallback_keeps_last_cause() {
        use std::error::Error as _;
        let e = FallbackError::Exhausted {
            attempts: 3,
            candidate: "readability".into(),
            source: "HTTP 503".into(),
        };
        assert!(e.to_string().contains("readability"));
        assert_eq!(e.source().map(|s| s.to_string()).as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn stage_error_serialises() {
        let e = StageError::MissingOutput {
            stage: "s".into(),
            field: "title".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
