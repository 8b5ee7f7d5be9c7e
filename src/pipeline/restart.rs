//! Resuming a job from a checkpoint.
//!
//! Restarting from a stage clears the outputs and recorded timings of that
//! stage and of every stage declared after it, disabled ones included, then
//! runs the pipeline
//! again. The skip rule does the rest: stages before the restart point find
//! their outputs present and are skipped.

use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, RestartPoint};
use crate::document::{kind_tag, Document, DocumentState};
use crate::error::PipelineError;
use crate::output::PipelineRun;
use crate::pipeline::fold::fold;
use crate::pipeline::stage::Pipeline;
use serde_json::Value;
use std::path::Path;
use tracing::info;

/// Load `checkpoint`, clear state from `point` onward and run `pipeline`.
///
/// The restart point is checked before anything is read, so a mistyped
/// stage name fails with [`PipelineError::UnknownStage`] instead of
/// re-running the whole job.
pub async fn restart<D: Document>(
    pipeline: &Pipeline<D>,
    point: &RestartPoint,
    checkpoint: &Path,
    config: &EngineConfig,
) -> Result<PipelineRun<D>, PipelineError> {
    let from = pipeline.restart_index(point)?;

    let store = CheckpointStore::new(&config.checkpoint_dir);
    let mut snapshot = store.load_snapshot(&kind_tag::<D>(), checkpoint)?;

    let Some(from) = from else {
        info!("Resuming {} from {}", D::KIND, checkpoint.display());
        let document: D = DocumentState::restore_tolerant(snapshot)?;
        return fold(pipeline, document, config).await;
    };

    let rerun = &pipeline.stages()[from..];
    let mut cleared = 0;
    for stage in rerun {
        for field in stage.output_fields() {
            snapshot.insert(field.clone(), Value::Null);
            cleared += 1;
        }
    }
    info!(
        "Restarting {} from {}: cleared {} fields of {} stages",
        D::KIND,
        point,
        cleared,
        rerun.len()
    );

    let mut document: D = DocumentState::restore_tolerant(snapshot)?;
    for stage in rerun {
        document.execution_times_mut().remove(stage.name());
    }
    fold(pipeline, document, config).await
}

/// Run `document` through `pipeline`, restarting from the newest matching
/// checkpoint when [`EngineConfig::start_from`] is set.
///
/// Without `start_from`, or when no checkpoint matches the document's
/// identity, this is a fresh [`fold`].
pub async fn run_or_resume<D: Document>(
    pipeline: &Pipeline<D>,
    document: D,
    config: &EngineConfig,
) -> Result<PipelineRun<D>, PipelineError> {
    if let Some(point) = &config.start_from {
        pipeline.restart_index(point)?;
        let store = CheckpointStore::new(&config.checkpoint_dir);
        match store.latest::<D>(&document.identity()?)? {
            Some(entry) => return restart(pipeline, point, &entry.path, config).await,
            None => info!("No {} checkpoint for this job; starting fresh", D::KIND),
        }
    }
    fold(pipeline, document, config).await
}
