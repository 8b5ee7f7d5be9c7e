//! The stage executor.
//!
//! [`fold`] walks the enabled stages in declaration order, threading one
//! document through them:
//!
//! 1. **skip** when any declared output is already set, without touching
//!    the stage's resources;
//! 2. **gather** deep copies of the declared inputs;
//! 3. **call** the stage function inside its resource scope;
//! 4. **bind** the returned values to the declared outputs, checking arity
//!    and that the document type still accepts them;
//! 5. **time** the stage on success.
//!
//! A failing stage is logged and its outputs stay unset; the next stage
//! runs regardless unless the failing one was declared critical. Exactly
//! one checkpoint is written per run, after the last stage attempted.

use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::document::{Document, DocumentState};
use crate::error::{PipelineError, StageError};
use crate::output::{PipelineRun, RunReport};
use crate::pipeline::resource::{run_with_resources, ScopeError};
use crate::pipeline::stage::{FailurePolicy, Pipeline, Stage, StageInputs};
use crate::progress::PipelineProgressCallback;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn, Level};

/// Run every enabled stage of `pipeline` against `document` and checkpoint
/// the result.
///
/// Stage failures are collected in [`RunReport::failed`]. The only stage
/// failure returned as `Err` is one from a critical stage, after the
/// partial document has been checkpointed.
pub async fn fold<D: Document>(
    pipeline: &Pipeline<D>,
    document: D,
    config: &EngineConfig,
) -> Result<PipelineRun<D>, PipelineError> {
    let run_start = Instant::now();
    let mut state = DocumentState::capture(&document)?;
    drop(document);

    let active: Vec<&Stage> = pipeline.active().collect();
    let total = active.len();
    let progress: Option<&dyn PipelineProgressCallback> = config.progress_callback.as_deref();

    info!("Running {} pipeline: {} stages", D::KIND, total);
    if let Some(cb) = progress {
        cb.on_run_start(D::KIND, total);
    }

    let mut report = RunReport::default();
    let mut timings = Vec::new();
    let mut aborted: Option<StageError> = None;

    for (index, stage) in active.iter().enumerate() {
        let position = index + 1;

        if stage.is_satisfied(&state) {
            debug!("[{}/{}] {}: outputs present, skipped", position, total, stage.name());
            report.skipped.push(stage.name().to_string());
            if let Some(cb) = progress {
                cb.on_stage_skipped(stage.name(), position, total);
            }
            continue;
        }

        if let Some(cb) = progress {
            cb.on_stage_start(stage.name(), position, total);
        }
        let started = Instant::now();

        match run_stage::<D>(stage, &mut state, config.arg_preview_chars).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(
                    "[{}/{}] {} done in {:.2}s",
                    position,
                    total,
                    stage.name(),
                    elapsed.as_secs_f64()
                );
                timings.push((stage.name().to_string(), elapsed.as_secs_f64()));
                report.executed.push(stage.name().to_string());
                if let Some(cb) = progress {
                    cb.on_stage_complete(stage.name(), position, total, elapsed);
                }
            }
            Err(err) => {
                warn!("[{}/{}] {}", position, total, err);
                if let Some(cb) = progress {
                    cb.on_stage_error(stage.name(), position, total, &err.to_string());
                }
                report.failed.push(err.clone());
                if stage.failure_policy() == FailurePolicy::Abort {
                    aborted = Some(err);
                    break;
                }
            }
        }
    }

    if let Some(cb) = progress {
        cb.on_run_complete(total, report.executed.len());
    }

    let mut document: D = state.into_document()?;
    document.execution_times_mut().extend(timings);
    let checkpoint = CheckpointStore::new(&config.checkpoint_dir).save(&document)?;
    report.total_duration_ms = run_start.elapsed().as_millis() as u64;

    if let Some(source) = aborted {
        return Err(PipelineError::CriticalStageFailed {
            stage: source.stage().to_string(),
            source,
            checkpoint,
        });
    }

    info!(
        "{} pipeline finished: {} run, {} skipped, {} failed in {}ms",
        D::KIND,
        report.executed.len(),
        report.skipped.len(),
        report.failed.len(),
        report.total_duration_ms
    );
    Ok(PipelineRun {
        document,
        checkpoint,
        report,
    })
}

/// Execute one stage and bind its outputs into `state`.
///
/// `state` is only modified when every output binds and the document type
/// accepts the new values.
async fn run_stage<D: Document>(
    stage: &Stage,
    state: &mut DocumentState,
    preview_chars: usize,
) -> Result<(), StageError> {
    let inputs = stage.gather(state);
    let preview = tracing::enabled!(Level::DEBUG).then(|| inputs.preview(preview_chars));

    let bound = match call_and_bind(stage, inputs).await {
        Ok(bound) => bound,
        Err(err) => {
            if let Some(preview) = preview {
                debug!("{} arguments:\n{}", stage.name(), preview);
            }
            return Err(err);
        }
    };

    let mut next = state.clone();
    for (field, value) in bound {
        next.set(field, value);
    }
    next.validate::<D>().map_err(|e| StageError::OutputType {
        stage: stage.name().to_string(),
        detail: e.to_string(),
    })?;
    *state = next;
    Ok(())
}

async fn call_and_bind(
    stage: &Stage,
    inputs: StageInputs,
) -> Result<Vec<(String, Value)>, StageError> {
    let name = stage.name().to_string();
    let output = run_with_resources(stage.resource_list(), |ctx| stage.invoke(inputs, ctx))
        .await
        .map_err(|scope| match scope {
            ScopeError::Acquire { resource, source } | ScopeError::Setup { resource, source } => {
                StageError::Resource {
                    stage: name.clone(),
                    resource,
                    detail: source.to_string(),
                }
            }
            ScopeError::Call(e) => StageError::Failed {
                stage: name.clone(),
                detail: e.to_string(),
            },
            ScopeError::Panicked(detail) => StageError::Panicked {
                stage: name.clone(),
                detail,
            },
        })?;
    stage.bind(output)
}
