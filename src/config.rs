//! Configuration types for pipeline execution.
//!
//! All engine behaviour is controlled through [`EngineConfig`], built via its
//! [`EngineConfigBuilder`]. Stage selection is *not* configured here: each
//! [`crate::Stage`] carries its own `enabled` flag, evaluated once when the
//! application builds its pipeline.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;

/// Default directory holding checkpoint files.
pub const DEFAULT_CHECKPOINT_DIR: &str = "data";

/// Configuration for running and restarting pipelines.
///
/// Built via [`EngineConfig::builder()`] or using [`EngineConfig::default()`].
///
/// # Example
/// ```rust
/// use mobibot_pipeline::{EngineConfig, RestartPoint};
///
/// let config = EngineConfig::builder()
///     .checkpoint_dir("/tmp/mobibot")
///     .start_from(RestartPoint::stage("translate_model"))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct EngineConfig {
    /// Flat directory where every run writes its checkpoint. Default: `data`.
    pub checkpoint_dir: PathBuf,

    /// Where [`crate::run_or_resume`] restarts a job that already has a
    /// checkpoint. `None` always starts a fresh document. Default: `None`.
    pub start_from: Option<RestartPoint>,

    /// Characters of each argument shown in the debug log when a stage
    /// fails. Default: 128.
    pub arg_preview_chars: usize,

    /// Receives run and stage events. Default: none.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            start_from: None,
            arg_preview_chars: 128,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("start_from", &self.start_from)
            .field("arg_preview_chars", &self.arg_preview_chars)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    pub fn start_from(mut self, point: RestartPoint) -> Self {
        self.config.start_from = Some(point);
        self
    }

    pub fn arg_preview_chars(mut self, n: usize) -> Self {
        self.config.arg_preview_chars = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, PipelineError> {
        let c = &self.config;
        if c.checkpoint_dir.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "checkpoint directory must not be empty".into(),
            ));
        }
        if c.arg_preview_chars == 0 {
            return Err(PipelineError::InvalidConfig(
                "argument preview must show at least 1 character".into(),
            ));
        }
        if let Some(RestartPoint::Stage(name)) = &c.start_from {
            if name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "restart stage name must not be blank".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Where a restarted run begins.
///
/// Restarting clears the outputs of the chosen stage and of every stage
/// declared after it, so the skip rule re-executes exactly that tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPoint {
    /// Clear every stage's outputs: a full re-run that keeps only the
    /// fields no stage produces (the document's identity).
    Beginning,
    /// Clear from the first stage with this name onward. A name that
    /// matches no stage is an error, never a silent full re-run.
    Stage(String),
    /// Clear nothing; continue a crashed or partially failed run.
    Resume,
}

impl RestartPoint {
    pub fn stage(name: impl Into<String>) -> Self {
        RestartPoint::Stage(name.into())
    }
}

impl fmt::Display for RestartPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPoint::Beginning => f.write_str("<beginning>"),
            RestartPoint::Stage(name) => f.write_str(name),
            RestartPoint::Resume => f.write_str("<resume>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.checkpoint_dir, PathBuf::from("data"));
        assert_eq!(c.arg_preview_chars, 128);
        assert!(c.start_from.is_none());
        assert!(c.progress_callback.is_none());
    }

    #[test]
    fn builder_rejects_zero_preview() {
        let err = EngineConfig::builder().arg_preview_chars(0).build().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn builder_rejects_blank_stage() {
        let err = EngineConfig::builder()
            .start_from(RestartPoint::stage("  "))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn debug_hides_callback() {
        let c = EngineConfig::builder()
            .progress_callback(std::sync::Arc::new(crate::progress::NoopProgressCallback))
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(dbg.contains("<dyn PipelineProgressCallback>"));
    }

    #[test]
    fn restart_point_display() {
        assert_eq!(RestartPoint::stage("ocr").to_string(), "ocr");
        assert_eq!(RestartPoint::Beginning.to_string(), "<beginning>");
    }
}
