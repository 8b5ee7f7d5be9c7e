//! Progress-callback trait for run and stage events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::EngineConfigBuilder::progress_callback`] to receive
//! events as the executor works through a pipeline.
//!
//! # Example
//!
//! ```rust
//! use mobibot_pipeline::{EngineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use std::time::Duration;
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_stage_complete(&self, stage: &str, position: usize, total: usize, elapsed: Duration) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} done {position}/{total} in {:.2}s", elapsed.as_secs_f64());
//!     }
//! }
//!
//! let config = EngineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

/// Called by the executor as it processes each stage.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `position` is 1-indexed within the enabled stages.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage, with the number of enabled stages.
    fn on_run_start(&self, kind: &str, total_stages: usize) {
        let _ = (kind, total_stages);
    }

    /// Called just before a stage's resources are acquired.
    fn on_stage_start(&self, stage: &str, position: usize, total: usize) {
        let _ = (stage, position, total);
    }

    /// Called when a stage is skipped because its outputs are already set.
    fn on_stage_skipped(&self, stage: &str, position: usize, total: usize) {
        let _ = (stage, position, total);
    }

    /// Called when a stage's outputs have been bound to the document.
    fn on_stage_complete(&self, stage: &str, position: usize, total: usize, elapsed: Duration) {
        let _ = (stage, position, total, elapsed);
    }

    /// Called when a stage fails; `error` is the human-readable cause.
    fn on_stage_error(&self, stage: &str, position: usize, total: usize, error: &str) {
        let _ = (stage, position, total, error);
    }

    /// Called once after all stages were attempted (or a critical one failed),
    /// before the checkpoint is written.
    ///
    /// * `executed` — stages whose function ran successfully in this run
    fn on_run_complete(&self, total_stages: usize, executed: usize) {
        let _ = (total_stages, executed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::EngineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgressCallback for Recorder {
        fn on_stage_skipped(&self, stage: &str, position: usize, total: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("skip {stage} {position}/{total}"));
        }

        fn on_stage_error(&self, stage: &str, _position: usize, _total: usize, error: &str) {
            self.events.lock().unwrap().push(format!("error {stage}: {error}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start("video", 3);
        cb.on_stage_start("download", 1, 3);
        cb.on_stage_complete("download", 1, 3, Duration::from_millis(5));
        cb.on_stage_skipped("split", 2, 3);
        cb.on_stage_error("ocr", 3, 3, "boom");
        cb.on_run_complete(3, 1);
    }

    #[test]
    fn overridden_methods_receive_events() {
        let rec = Recorder::default();
        rec.on_stage_skipped("split", 2, 5);
        rec.on_stage_error("ocr", 3, 5, "timeout");
        rec.on_stage_start("ignored", 4, 5);
        let events = rec.events.lock().unwrap();
        assert_eq!(events.as_slice(), ["skip split 2/5", "error ocr: timeout"]);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_run_start("pdfdocument", 10);
    }
}
