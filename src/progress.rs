//! Progress-observer trait for run and image events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] to receive events as
//! the orchestrator moves runs through their stages. The CLI forwards them to
//! a terminal progress bar; a service could forward them to metrics or a
//! websocket.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfvision::{PipelineConfig, PipelineObserver, ProgressObserver};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     described: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_image_complete(&self, run_id: &str, page_index: usize, image_index: usize, _len: usize) {
//!         self.described.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{run_id}: page {page_index} image {image_index} described");
//!     }
//! }
//!
//! let observer = Arc::new(CountingObserver { described: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .progress(observer as ProgressObserver)
//!     .build()
//!     .unwrap();
//! ```

use crate::run::PipelineRun;
use std::sync::Arc;

/// Called by the orchestrator as runs progress.
///
/// Implementations must be `Send + Sync`: images of one run, and different
/// runs, are processed on different tasks, so every method may be called
/// concurrently. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// A run left `Pending` and is about to extract.
    fn on_run_start(&self, run_id: &str) {
        let _ = run_id;
    }

    /// Extraction finished; `image_count` Infer invocations will follow.
    fn on_extracted(&self, run_id: &str, image_count: usize) {
        let _ = (run_id, image_count);
    }

    /// An image was described. `description_len` is the byte length of the text.
    fn on_image_complete(
        &self,
        run_id: &str,
        page_index: usize,
        image_index: usize,
        description_len: usize,
    ) {
        let _ = (run_id, page_index, image_index, description_len);
    }

    /// An image failed terminally (retries exhausted or rejected).
    fn on_image_error(&self, run_id: &str, page_index: usize, image_index: usize, error: &str) {
        let _ = (run_id, page_index, image_index, error);
    }

    /// The run reached `Succeeded` or `Failed`.
    fn on_run_complete(&self, run: &PipelineRun) {
        let _ = run;
    }
}

/// A no-op observer.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Type stored in [`crate::config::PipelineConfig`].
pub type ProgressObserver = Arc<dyn PipelineObserver>;
