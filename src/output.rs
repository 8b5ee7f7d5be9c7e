//! Results of a pipeline run.

use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A finished (possibly partially completed) run.
#[derive(Debug)]
pub struct PipelineRun<D> {
    /// The document with every successfully produced output bound.
    pub document: D,
    /// The checkpoint written at the end of this run.
    pub checkpoint: PathBuf,
    pub report: RunReport,
}

/// What happened to each enabled stage during one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Stages whose function ran and whose outputs were bound, in order.
    pub executed: Vec<String>,
    /// Stages skipped because their outputs were already set.
    pub skipped: Vec<String>,
    /// Stages that failed; their outputs were left unset.
    pub failed: Vec<StageError>,
    pub total_duration_ms: u64,
}

impl RunReport {
    /// `true` when no stage failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(StageError::stage)
    }
}
